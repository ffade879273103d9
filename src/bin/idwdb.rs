use std::{error::Error, path::PathBuf};

use clap::{Parser, Subcommand};
use futures::executor::block_on;
use idwdb::{
    ClientConfig, Credentials, DatabaseClient, Endpoint, Query, Range, Reactor, Row, Value,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address: host, host:port, [v6]:port or an IP literal
    endpoint: Endpoint,
    /// Server public key (key blob or PEM)
    #[arg(long)]
    server_key: PathBuf,
    /// Client private key (key blob or PEM)
    #[arg(long)]
    client_key: PathBuf,
    /// Prefix the operation with a transaction marker
    #[arg(long)]
    transaction: bool,
    /// Largest response frame accepted, in bytes
    #[arg(long)]
    max_message_size: Option<usize>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch rows by primary key
    Get {
        table: String,
        #[arg(required = true, value_parser = parse_value)]
        keys: Vec<Value>,
    },
    /// Fetch every row with start < key < end
    Range {
        table: String,
        #[arg(value_parser = parse_value)]
        start: Value,
        #[arg(value_parser = parse_value)]
        end: Value,
    },
    /// Fetch every row whose text key starts with a prefix
    Prefix { table: String, prefix: String },
    /// Insert or replace one row
    Put {
        table: String,
        #[arg(value_parser = parse_value)]
        key: Value,
        /// Columns as name=value
        #[arg(value_parser = parse_column)]
        columns: Vec<(String, Value)>,
    },
    /// Delete rows by primary key
    Delete {
        table: String,
        #[arg(required = true, value_parser = parse_value)]
        keys: Vec<Value>,
    },
    /// Delete every row with start < key < end
    DeleteRange {
        table: String,
        #[arg(value_parser = parse_value)]
        start: Value,
        #[arg(value_parser = parse_value)]
        end: Value,
    },
}

/// Integers become `i64` keys, `str:` forces text, anything else is text.
fn parse_value(s: &str) -> Result<Value, String> {
    if let Some(text) = s.strip_prefix("str:") {
        return Ok(Value::from(text));
    }
    Ok(s.parse::<i64>().map_or_else(|_| Value::from(s), Value::from))
}

fn parse_column(s: &str) -> Result<(String, Value), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{s}'"))?;
    if name.is_empty() {
        return Err(format!("empty column name in '{s}'"));
    }
    Ok((name.to_string(), parse_value(value)?))
}

impl Command {
    fn to_query(&self, transaction: bool) -> Result<Query, Box<dyn Error>> {
        let table = match self {
            Command::Get { table, .. }
            | Command::Range { table, .. }
            | Command::Prefix { table, .. }
            | Command::Put { table, .. }
            | Command::Delete { table, .. }
            | Command::DeleteRange { table, .. } => table,
        };
        let mut query = Query::new(table.as_str());
        if transaction {
            query = query.begin_transaction();
        }

        let query = match self {
            Command::Get { keys, .. } => query.fetch(keys.iter().cloned()),
            Command::Range { start, end, .. } => {
                query.fetch_range(Range::new(start.clone(), end.clone()))
            }
            Command::Prefix { prefix, .. } => query.fetch_range(Range::starts_with(prefix)?),
            Command::Put { key, columns, .. } => {
                let row = columns
                    .iter()
                    .fold(Row::new(key.clone()), |row, (name, value)| {
                        row.add_column(name.as_str(), value.clone())
                    });
                query.insert_or_replace([row])
            }
            Command::Delete { keys, .. } => query.delete(keys.iter().cloned()),
            Command::DeleteRange { start, end, .. } => {
                query.delete_range(Range::new(start.clone(), end.clone()))
            }
        };
        Ok(query)
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let query = cli.command.to_query(cli.transaction)?;
    let credentials = Credentials::load(&cli.server_key, &cli.client_key)?;

    let mut config = ClientConfig::new(cli.endpoint);
    if let Some(max) = cli.max_message_size {
        config = config.with_max_message_size(max);
    }

    let reactor = Reactor::start()?;
    let mut client = DatabaseClient::new(config, credentials, reactor.handle());

    let mut count = 0usize;
    block_on(async {
        client.connect().await?;
        client
            .run_query(&query, |rows| {
                for row in rows {
                    println!("{row}");
                    count += 1;
                }
                true
            })
            .await
    })?;
    client.disconnect();

    log::info!("{count} rows");
    Ok(())
}

//! Client driver for IDWDB table servers.
//!
//! # Overview
//!
//! - [`query`]: build a [`Query`] and encode it for the wire.
//! - [`data`]: [`Value`], [`Row`] and the [`Record`] mapping.
//! - [`protocol`]: reactor, sockets, framing and the secure session.
//! - [`client`]: [`DatabaseClient`], which connects and runs queries.
//!
//! # Example
//! ```no_run
//! use futures::executor::block_on;
//! use idwdb::{ClientConfig, Credentials, DatabaseClient, Query, Reactor};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let reactor = Reactor::start()?;
//! let credentials = Credentials::load("server.pub", "client.key")?;
//! let config = ClientConfig::new("db.local:3883".parse()?);
//! let mut client = DatabaseClient::new(config, credentials, reactor.handle());
//!
//! block_on(async {
//!     client.connect().await?;
//!     client
//!         .run_query(&Query::new("users").fetch([1i64, 2]), |rows| {
//!             rows.iter().for_each(|row| println!("{row}"));
//!             true
//!         })
//!         .await
//! })?;
//! # Ok(())
//! # }
//! ```
pub mod client;
pub mod config;
pub mod data;
pub mod protocol;
pub mod query;

#[cfg(test)]
mod testing;

pub use client::{ClientError, DatabaseClient};
pub use config::{ClientConfig, ConfigError, Endpoint};
pub use data::{Record, RecordError, Row, Value};
pub use protocol::{Credentials, Reactor, ReactorHandle};
pub use query::{Query, QueryError, Range};

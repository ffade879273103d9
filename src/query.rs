//! Table queries and their wire encoding.
//!
//! A [`Query`] is an ordered list of operations against one table. It is assembled with a
//! consuming builder, serialized once and sent to the server as a single message.
//!
//! # Binary Format
//!
//! ```text
//! ┌────────┬──────────────┬─────────────┬──────────────┬─────────────┬─────┐
//! │ marker │ block length │ block       │ block length │ block       │ ... │
//! │ 0x02   │ u32 LE       │ opcode + .. │ u32 LE       │ opcode + .. │     │
//! └────────┴──────────────┴─────────────┴──────────────┴─────────────┴─────┘
//! ```
//!
//! | opcode | operation | payload |
//! |---|---|---|
//! | 0 | fetch by keys | repeated (u16 length, key) |
//! | 1 | insert or replace | u32 row count, rows |
//! | 3 | fetch range | (u16 length, start key), (u16 length, end key) |
//! | 4 | delete by keys | repeated (u16 length, key) |
//! | 5 | delete range | (u16 length, start key), (u16 length, end key) |
//! | 6 | begin transaction | none |
//!
//! Consecutive key fetches, key deletes or inserts against the same table are merged into one
//! block, so appending many small batches costs no extra framing.
//!
//! # Example
//! ```rust
//! use idwdb::{Query, Range, Row};
//!
//! let query = Query::new("users")
//!     .begin_transaction()
//!     .insert_or_replace([Row::new(1i64).add_column("name", "ada")])
//!     .insert_or_replace([Row::new(2i64).add_column("name", "grace")])
//!     .fetch_range(Range::starts_with("a").unwrap());
//!
//! assert_eq!(query.operations().len(), 3);
//! ```
use bytes::BufMut;
use thiserror::Error;

use crate::data::{Record, Row, Value, error::CodecError, row::put_key};

/// First byte of every query message.
pub const QUERY_MARKER: u8 = 0x02;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("a prefix range requires a non-empty prefix")]
    EmptyPrefix,

    #[error("the last character of prefix '{0}' has no successor")]
    PrefixOverflow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    FetchKeys = 0,
    InsertRows = 1,
    FetchRange = 3,
    DeleteKeys = 4,
    DeleteRange = 5,
    BeginTransaction = 6,
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        value as u8
    }
}

/// Key range, exclusive at both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub start: Value,
    pub end: Value,
}

impl Range {
    pub fn new(start: impl Into<Value>, end: impl Into<Value>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    /// Range covering every text key that begins with `prefix`.
    ///
    /// The upper bound is the prefix with its last character incremented, so `"ab"` yields
    /// `("ab", "ac")`.
    pub fn starts_with(prefix: &str) -> Result<Self, QueryError> {
        let mut chars: Vec<char> = prefix.chars().collect();
        let last = chars.pop().ok_or(QueryError::EmptyPrefix)?;
        let next = match last {
            '\u{D7FF}' => '\u{E000}',
            c => char::from_u32(c as u32 + 1)
                .ok_or_else(|| QueryError::PrefixOverflow(prefix.to_string()))?,
        };
        chars.push(next);

        Ok(Self::new(prefix, chars.into_iter().collect::<String>()))
    }
}

/// One queued operation and the payload its kind needs.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    FetchKeys(Vec<Value>),
    FetchRange(Range),
    InsertOrReplace(Vec<Row>),
    DeleteKeys(Vec<Value>),
    DeleteRange(Range),
    BeginTransaction,
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::FetchKeys(_) => Opcode::FetchKeys,
            Operation::FetchRange(_) => Opcode::FetchRange,
            Operation::InsertOrReplace(_) => Opcode::InsertRows,
            Operation::DeleteKeys(_) => Opcode::DeleteKeys,
            Operation::DeleteRange(_) => Opcode::DeleteRange,
            Operation::BeginTransaction => Opcode::BeginTransaction,
        }
    }

    /// Folds `next` into this operation when both carry lists of the same kind, handing
    /// it back otherwise.
    fn coalesce(&mut self, next: Operation) -> Result<(), Operation> {
        match (self, next) {
            (Operation::FetchKeys(keys), Operation::FetchKeys(more))
            | (Operation::DeleteKeys(keys), Operation::DeleteKeys(more)) => {
                keys.extend(more);
                Ok(())
            }
            (Operation::InsertOrReplace(rows), Operation::InsertOrReplace(more)) => {
                rows.extend(more);
                Ok(())
            }
            (_, next) => Err(next),
        }
    }

    fn encode_into(&self, table: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.put_u8(self.opcode().into());
        match self {
            Operation::FetchKeys(keys) | Operation::DeleteKeys(keys) => {
                for key in keys {
                    put_key(table, key, out)?;
                }
            }
            Operation::InsertOrReplace(rows) => {
                let count = u32::try_from(rows.len()).map_err(|_| CodecError::LengthOverflow {
                    field: "row count",
                    len: rows.len(),
                })?;
                out.put_u32_le(count);
                for row in rows {
                    row.encode_into(out)?;
                }
            }
            Operation::FetchRange(range) | Operation::DeleteRange(range) => {
                put_key(table, &range.start, out)?;
                put_key(table, &range.end, out)?;
            }
            Operation::BeginTransaction => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOperation {
    pub table: String,
    pub operation: Operation,
}

impl QueryOperation {
    /// Encodes the operation block: opcode followed by its payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.operation.encode_into(&self.table, &mut out)?;
        Ok(out)
    }
}

/// A batch of operations against one table.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    table: String,
    operations: Vec<QueryOperation>,
}

impl Query {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            operations: Vec::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn operations(&self) -> &[QueryOperation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn push(mut self, operation: Operation) -> Self {
        let operation = match self.operations.last_mut() {
            Some(last) if last.table == self.table => match last.operation.coalesce(operation) {
                Ok(()) => return self,
                Err(operation) => operation,
            },
            _ => operation,
        };
        self.operations.push(QueryOperation {
            table: self.table.clone(),
            operation,
        });
        self
    }

    /// Marks the start of a transaction on the server.
    pub fn begin_transaction(self) -> Self {
        self.push(Operation::BeginTransaction)
    }

    /// Retrieves the rows matching `keys`.
    pub fn fetch<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Value>,
    {
        self.push(Operation::FetchKeys(keys.into_iter().map(Into::into).collect()))
    }

    /// Retrieves every row inside `range`.
    pub fn fetch_range(self, range: Range) -> Self {
        self.push(Operation::FetchRange(range))
    }

    /// Inserts `rows`, replacing rows that already exist. Each row is assigned to this
    /// query's table.
    pub fn insert_or_replace<I>(self, rows: I) -> Self
    where
        I: IntoIterator<Item = Row>,
    {
        let table = self.table.clone();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.set_table(table.as_str());
                row
            })
            .collect();
        self.push(Operation::InsertOrReplace(rows))
    }

    pub fn insert_record<R: Record>(self, record: &R) -> Self {
        self.insert_or_replace([Row::from_record(record)])
    }

    /// Deletes the rows matching `keys`.
    pub fn delete<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<Value>,
    {
        self.push(Operation::DeleteKeys(
            keys.into_iter().map(Into::into).collect(),
        ))
    }

    /// Deletes every row inside `range`.
    pub fn delete_range(self, range: Range) -> Self {
        self.push(Operation::DeleteRange(range))
    }

    /// Encodes the query message.
    pub fn serialize(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![QUERY_MARKER];
        for op in self.operations.iter() {
            let block = op.to_bytes()?;
            let len = u32::try_from(block.len()).map_err(|_| CodecError::LengthOverflow {
                field: "operation block",
                len: block.len(),
            })?;
            out.put_u32_le(len);
            out.put_slice(&block);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use crate::data::{MAX_PRIMARY_KEY_SIZE, encode_key};

    use super::*;

    /// Splits a serialized query into its operation blocks.
    fn blocks(bytes: &[u8]) -> Vec<Vec<u8>> {
        assert_eq!(bytes[0], QUERY_MARKER);
        let mut rest = &bytes[1..];
        let mut out = Vec::new();
        while !rest.is_empty() {
            let len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
            out.push(rest[4..4 + len].to_vec());
            rest = &rest[4 + len..];
        }
        out
    }

    fn keyed(table: &str, keys: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        for key in keys {
            let key = encode_key(table, &Value::from(*key)).unwrap();
            out.extend_from_slice(&(key.len() as u16).to_le_bytes());
            out.extend_from_slice(&key);
        }
        out
    }

    #[test]
    fn empty_query_is_marker_only() {
        assert_eq!(Query::new("T").serialize().unwrap(), vec![0x02]);
    }

    #[test]
    fn prefix_range() {
        let range = Range::starts_with("ab").unwrap();

        assert_eq!(range.start, Value::Text("ab".into()));
        assert_eq!(range.end, Value::Text("ac".into()));
    }

    #[test]
    fn prefix_range_edges() {
        assert_eq!(Range::starts_with(""), Err(QueryError::EmptyPrefix));
        assert!(matches!(
            Range::starts_with("a\u{10FFFF}"),
            Err(QueryError::PrefixOverflow(_))
        ));
        assert_eq!(
            Range::starts_with("\u{D7FF}").unwrap().end,
            Value::Text("\u{E000}".into())
        );
    }

    #[test]
    fn fetches_coalesce_in_order() {
        let query = Query::new("T").fetch(["a"]).fetch(["b", "c"]);
        let blocks = blocks(&query.serialize().unwrap());

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0][0], u8::from(Opcode::FetchKeys));
        assert_eq!(&blocks[0][1..], keyed("T", &["a", "b", "c"]).as_slice());
    }

    #[test]
    fn deletes_coalesce() {
        let query = Query::new("T").delete(["x"]).delete(["y"]);
        let blocks = blocks(&query.serialize().unwrap());

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0][0], u8::from(Opcode::DeleteKeys));
        assert_eq!(&blocks[0][1..], keyed("T", &["x", "y"]).as_slice());
    }

    #[test]
    fn inserts_coalesce_into_one_block() {
        let first = Row::new("k1").add_column("v", 1i32);
        let second = Row::new("k2").add_column("v", 2i32);
        let query = Query::new("T")
            .insert_or_replace([first.clone()])
            .insert_or_replace([second.clone()]);
        let blocks = blocks(&query.serialize().unwrap());

        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block[0], u8::from(Opcode::InsertRows));
        assert_eq!(u32::from_le_bytes(block[1..5].try_into().unwrap()), 2);

        let rows = crate::data::decode_rows(&block[5..]).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.table() == "T"));
        assert_eq!(rows[0].key(), first.key());
        assert_eq!(rows[1].key(), second.key());
    }

    #[test]
    fn different_kinds_do_not_coalesce() {
        let query = Query::new("T")
            .fetch(["a"])
            .delete(["a"])
            .fetch(["b"])
            .begin_transaction()
            .begin_transaction();

        let ops: Vec<Opcode> = query
            .operations()
            .iter()
            .map(|op| op.operation.opcode())
            .collect();
        assert_eq!(
            ops,
            vec![
                Opcode::FetchKeys,
                Opcode::DeleteKeys,
                Opcode::FetchKeys,
                Opcode::BeginTransaction,
                Opcode::BeginTransaction
            ]
        );
        assert_eq!(blocks(&query.serialize().unwrap()).len(), 5);
    }

    #[test]
    fn range_blocks() {
        let query = Query::new("T")
            .fetch_range(Range::new("a", "b"))
            .delete_range(Range::new("c", "d"));
        let blocks = blocks(&query.serialize().unwrap());

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0][0], u8::from(Opcode::FetchRange));
        assert_eq!(&blocks[0][1..], keyed("T", &["a", "b"]).as_slice());
        assert_eq!(blocks[1][0], u8::from(Opcode::DeleteRange));
        assert_eq!(&blocks[1][1..], keyed("T", &["c", "d"]).as_slice());
    }

    #[test]
    fn transaction_block_has_no_payload() {
        let query = Query::new("T").begin_transaction();
        assert_eq!(query.serialize().unwrap(), vec![0x02, 1, 0, 0, 0, 6]);
    }

    #[test]
    #[should_panic(expected = "KeyTooLarge")]
    fn oversized_fetch_key() {
        Query::new("T")
            .fetch(["k".repeat(MAX_PRIMARY_KEY_SIZE)])
            .serialize()
            .unwrap();
    }

    #[test]
    fn fetch_key_size_boundary() {
        // table "T": 2 bytes, text tag + 3-byte varint length: 4 bytes.
        let fits = "k".repeat(MAX_PRIMARY_KEY_SIZE - 7);
        let bytes = Query::new("T").fetch([fits]).serialize().unwrap();
        let block = &blocks(&bytes)[0];
        assert_eq!(block[1..3], ((MAX_PRIMARY_KEY_SIZE - 1) as u16).to_le_bytes());

        let too_long = "k".repeat(MAX_PRIMARY_KEY_SIZE - 6);
        let res = Query::new("T").delete([too_long]).serialize();
        assert!(matches!(
            res,
            Err(CodecError::KeyTooLarge { size: MAX_PRIMARY_KEY_SIZE, .. })
        ));
    }
}

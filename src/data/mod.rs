//! Row, key and value encoding.
//!
//! This module defines the data that travels between the driver and an IDWDB server: tagged
//! [`Value`]s, [`Row`]s and the canonical serialized primary key used by the server for routing
//! and equality.
//!
//! # Binary Format
//!
//! - Values are encoded with `bincode` using its standard configuration (little endian,
//!   variable-length integers). The enum discriminant of [`Value`] acts as the
//!   self-describing type tag, so decoding never needs an external type hint.
//! - Table and column names are UTF-8 behind a 7-bit variable-length prefix: seven bits per
//!   byte, low groups first, high bit set while more bytes follow.
//! - A serialized primary key is the owning table name followed by the encoded key value and
//!   must be shorter than [`MAX_PRIMARY_KEY_SIZE`] bytes.
//! - Fixed-width wire fields (key and column block lengths) are little-endian.
//!
//! # Key Components
//!
//! - [`Value`]: closed sum type over the supported primitive kinds.
//! - [`Row`]: a primary key, an owning table and a set of named columns.
//! - [`Record`]: explicit mapping between a user type and a [`Row`].
//!
//! # See Also
//!
//! - [`query`](crate::query): Encodes whole operations out of rows and keys.
pub mod record;
pub mod row;
pub mod value;

pub use record::{Record, RecordError};
pub use row::{Row, decode_rows, encode_key};
pub use error::CodecError;
pub use value::Value;

/// Exclusive upper bound on a serialized primary key (table name + key value).
pub const MAX_PRIMARY_KEY_SIZE: usize = 1000;

pub mod error {
    use thiserror::Error;

    use super::MAX_PRIMARY_KEY_SIZE;

    #[derive(Debug, Error)]
    pub enum CodecError {
        #[error(
            "[key][{table}]: primary key serializes to {size} bytes, must stay below {MAX_PRIMARY_KEY_SIZE}"
        )]
        KeyTooLarge { table: String, size: usize },

        #[error("[decode][{field}]: {needed} bytes required, {remaining} remaining")]
        Truncated {
            field: &'static str,
            needed: usize,
            remaining: usize,
        },

        #[error("[encode][{field}]: length {len} does not fit the wire field")]
        LengthOverflow { field: &'static str, len: usize },

        #[error("[decode][text]: {0}")]
        InvalidText(String),

        #[error("failed to encode value: {0}")]
        Encode(#[from] bincode::error::EncodeError),

        #[error("failed to decode value: {0}")]
        Decode(#[from] bincode::error::DecodeError),
    }
}

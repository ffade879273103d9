//! Mapping between user-defined types and [`Row`]s.
//!
//! Implement [`Record`] for a type to insert it with
//! [`Query::insert_record`](crate::query::Query::insert_record) and read it back with
//! [`Row::to_record`].
//!
//! # Example
//! ```rust
//! use idwdb::data::{Record, RecordError, Row, Value};
//!
//! struct User {
//!     id: i64,
//!     name: String,
//!     email: Option<String>,
//! }
//!
//! impl Record for User {
//!     fn primary_key(&self) -> Value {
//!         self.id.into()
//!     }
//!
//!     fn columns(&self) -> Vec<(&'static str, Value)> {
//!         vec![("name", self.name.clone().into()), ("email", self.email.clone().into())]
//!     }
//!
//!     fn from_row(row: &Row) -> Result<Self, RecordError> {
//!         Ok(User {
//!             id: row.key_as()?,
//!             name: row.column("name")?,
//!             email: row.optional_column("email")?,
//!         })
//!     }
//! }
//!
//! let user = User { id: 1, name: "ada".into(), email: None };
//! let row = Row::from_record(&user);
//! assert!(row.get("email").is_none());
//!
//! let back: User = row.to_record().unwrap();
//! assert_eq!(back.name, "ada");
//! ```
use thiserror::Error;

use super::{Row, Value, value::TypeMismatch};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("[record] missing column '{0}'")]
    MissingColumn(String),

    #[error("[record][{column}]: {cause}")]
    Type { column: String, cause: TypeMismatch },
}

/// A type that can be stored as a row.
pub trait Record: Sized {
    /// Value stored as the row's primary key.
    fn primary_key(&self) -> Value;

    /// Named column values. [`Value::Null`] entries are not written.
    fn columns(&self) -> Vec<(&'static str, Value)>;

    fn from_row(row: &Row) -> Result<Self, RecordError>;
}

impl Row {
    pub fn from_record<R: Record>(record: &R) -> Row {
        let mut row = Row::new(record.primary_key());
        for (name, value) in record.columns() {
            if !value.is_null() {
                row.set(name, value);
            }
        }
        row
    }

    pub fn to_record<R: Record>(&self) -> Result<R, RecordError> {
        R::from_row(self)
    }

    /// Reads a required column as `T`.
    pub fn column<T>(&self, name: &str) -> Result<T, RecordError>
    where
        T: for<'a> TryFrom<&'a Value, Error = TypeMismatch>,
    {
        let value = self
            .get(name)
            .ok_or_else(|| RecordError::MissingColumn(name.to_string()))?;
        T::try_from(value).map_err(|cause| RecordError::Type {
            column: name.to_string(),
            cause,
        })
    }

    /// Reads a column as `T`, treating an absent or null column as `None`.
    pub fn optional_column<T>(&self, name: &str) -> Result<Option<T>, RecordError>
    where
        T: for<'a> TryFrom<&'a Value, Error = TypeMismatch>,
    {
        match self.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.column(name).map(Some),
        }
    }

    /// Reads the primary key as `T`.
    pub fn key_as<T>(&self) -> Result<T, RecordError>
    where
        T: for<'a> TryFrom<&'a Value, Error = TypeMismatch>,
    {
        T::try_from(self.key()).map_err(|cause| RecordError::Type {
            column: "<primary key>".to_string(),
            cause,
        })
    }
}

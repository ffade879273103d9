use std::fmt;

use bincode::{Decode, Encode, config::Configuration, decode_from_slice, encode_into_std_write};
use bytes::{Buf, BufMut};
use thiserror::Error;

use super::{error::CodecError, row::take};

/// A 32-bit length never needs more than five 7-bit groups.
const MAX_TEXT_PREFIX: u32 = 5;

/// Tagged column or key value.
///
/// The variant discriminant is written ahead of the payload, so a decoder can always
/// reconstruct the value without knowing the column's type in advance.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Value {
    Null,
    Bool(bool),
    U8(u8),
    I16(i16),
    I32(i32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Raised when a [`Value`] is read as a type it does not hold.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("expected {expected} value, found {found}")]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

pub(crate) fn config() -> Configuration {
    bincode::config::standard()
}

impl Value {
    /// Name of the variant, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Appends the tagged encoding of this value to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        encode_into_std_write(self, out, config())?;
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decodes one value from the front of `buf`, advancing it past the consumed bytes.
    pub fn decode(buf: &mut &[u8]) -> Result<Value, CodecError> {
        let (value, read) = decode_from_slice::<Value, _>(*buf, config())?;
        *buf = &buf[read..];
        Ok(value)
    }
}

/// Appends UTF-8 text behind its 7-bit variable-length prefix, the encoding used for table
/// and column names.
pub(crate) fn encode_text(text: &str, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let mut len = i32::try_from(text.len()).map_err(|_| CodecError::LengthOverflow {
        field: "text",
        len: text.len(),
    })? as u32;
    while len >= 0x80 {
        out.put_u8(len as u8 | 0x80);
        len >>= 7;
    }
    out.put_u8(len as u8);
    out.put_slice(text.as_bytes());
    Ok(())
}

pub(crate) fn decode_text(buf: &mut &[u8]) -> Result<String, CodecError> {
    let mut len = 0u32;
    for shift in (0..MAX_TEXT_PREFIX * 7).step_by(7) {
        if !buf.has_remaining() {
            return Err(CodecError::Truncated {
                field: "text length",
                needed: 1,
                remaining: 0,
            });
        }
        let byte = buf.get_u8();
        len |= u32::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            let bytes = take(buf, len as usize, "text")?;
            return String::from_utf8(bytes.to_vec())
                .map_err(|e| CodecError::InvalidText(e.to_string()));
        }
    }
    Err(CodecError::InvalidText(format!(
        "length prefix longer than {MAX_TEXT_PREFIX} bytes"
    )))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v:?}"),
            Value::Bytes(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! value_conversions {
    ($($ty:ty => $variant:ident as $name:literal),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::$variant(value)
                }
            }

            impl TryFrom<&Value> for $ty {
                type Error = TypeMismatch;

                fn try_from(value: &Value) -> Result<Self, Self::Error> {
                    match value {
                        Value::$variant(v) => Ok(v.clone()),
                        other => Err(TypeMismatch {
                            expected: $name,
                            found: other.kind(),
                        }),
                    }
                }
            }
        )*
    };
}

value_conversions! {
    bool => Bool as "bool",
    u8 => U8 as "u8",
    i16 => I16 as "i16",
    i32 => I32 as "i32",
    i64 => I64 as "i64",
    u64 => U64 as "u64",
    f32 => F32 as "f32",
    f64 => F64 as "f64",
    String => Text as "text",
    Vec<u8> => Bytes as "bytes",
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

use std::{collections::BTreeMap, fmt};

use bytes::{Buf, BufMut};

use super::{
    MAX_PRIMARY_KEY_SIZE, Value,
    error::CodecError,
    value::{decode_text, encode_text},
};

/// A row of data: a primary key, the table it belongs to and its named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    table: String,
    key: Value,
    columns: BTreeMap<String, Value>,
}

/// Serializes a primary key together with its owning table; the pair is what the server
/// routes and compares on.
///
/// Fails with [`CodecError::KeyTooLarge`] rather than truncating when the result reaches
/// [`MAX_PRIMARY_KEY_SIZE`].
pub fn encode_key(table: &str, key: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_text(table, &mut out)?;
    key.encode_into(&mut out)?;

    if out.len() >= MAX_PRIMARY_KEY_SIZE {
        return Err(CodecError::KeyTooLarge {
            table: table.to_string(),
            size: out.len(),
        });
    }
    Ok(out)
}

/// Writes a serialized key behind its 2-byte length.
pub(crate) fn put_key(table: &str, key: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let key = encode_key(table, key)?;
    // Bounded by MAX_PRIMARY_KEY_SIZE, so this always fits.
    out.put_u16_le(key.len() as u16);
    out.put_slice(&key);
    Ok(())
}

pub(crate) fn take<'a>(
    buf: &mut &'a [u8],
    len: usize,
    field: &'static str,
) -> Result<&'a [u8], CodecError> {
    if buf.len() < len {
        return Err(CodecError::Truncated {
            field,
            needed: len,
            remaining: buf.len(),
        });
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

fn ensure(buf: &[u8], len: usize, field: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError::Truncated {
            field,
            needed: len,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

/// Decodes a buffer of back-to-back row encodings until it is exhausted.
pub fn decode_rows(mut buf: &[u8]) -> Result<Vec<Row>, CodecError> {
    let mut rows = Vec::new();
    while buf.has_remaining() {
        rows.push(Row::decode(&mut buf)?);
    }
    Ok(rows)
}

impl Row {
    /// Creates a row for `key`. The table is filled in when the row is added to a query.
    pub fn new(key: impl Into<Value>) -> Self {
        Self {
            table: String::new(),
            key: key.into(),
            columns: BTreeMap::new(),
        }
    }

    pub fn with_table(table: impl Into<String>, key: impl Into<Value>) -> Self {
        Self {
            table: table.into(),
            ..Self::new(key)
        }
    }

    /// Builder form of [`Row::set`].
    pub fn add_column(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.columns.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.columns.remove(name)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn set_key(&mut self, key: impl Into<Value>) {
        self.key = key.into();
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn set_table(&mut self, table: impl Into<String>) {
        self.table = table.into();
    }

    /// Appends the wire encoding of this row: the length-prefixed key block followed by the
    /// length-prefixed column block.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        put_key(&self.table, &self.key, out)?;

        let mut block = Vec::new();
        for (name, value) in self.columns.iter() {
            encode_text(name, &mut block)?;
            value.encode_into(&mut block)?;
        }
        let len = u32::try_from(block.len()).map_err(|_| CodecError::LengthOverflow {
            field: "column block",
            len: block.len(),
        })?;
        out.put_u32_le(len);
        out.put_slice(&block);
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        self.encode_into(&mut out)?;
        Ok(out)
    }

    /// Decodes one row from the front of `buf`, advancing it past the row.
    pub fn decode(buf: &mut &[u8]) -> Result<Row, CodecError> {
        ensure(buf, 2, "key length")?;
        let len = buf.get_u16_le() as usize;
        let mut key_block = take(buf, len, "key block")?;
        let table = decode_text(&mut key_block)?;
        let key = Value::decode(&mut key_block)?;

        ensure(buf, 4, "column block length")?;
        let len = buf.get_u32_le() as usize;
        let mut block = take(buf, len, "column block")?;
        let mut columns = BTreeMap::new();
        while block.has_remaining() {
            let name = decode_text(&mut block)?;
            let value = Value::decode(&mut block)?;
            columns.insert(name, value);
        }

        Ok(Row {
            table,
            key,
            columns,
        })
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.table, self.key)?;
        if self.columns.is_empty() {
            return Ok(());
        }
        write!(f, " {{")?;
        for (i, (name, value)) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {name}: {value}")?;
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64) -> Row {
        Row::with_table("users", id)
            .add_column("name", "ada")
            .add_column("age", 36i32)
            .add_column("avatar", Value::Bytes(vec![1, 2, 3]))
            .add_column("deleted", Value::Null)
    }

    #[test]
    fn row_round_trip() {
        let row = user(7);
        let bytes = row.to_bytes().unwrap();

        let mut buf = bytes.as_slice();
        let decoded = Row::decode(&mut buf).unwrap();

        assert!(buf.is_empty());
        assert_eq!(decoded.table(), "users");
        assert_eq!(decoded.key(), &Value::I64(7));
        assert_eq!(decoded, row);
    }

    #[test]
    fn row_wire_layout() {
        let row = Row::with_table("T", "k").add_column("c", 1u8);
        let bytes = row.to_bytes().unwrap();

        let key = encode_key("T", &Value::from("k")).unwrap();
        assert_eq!(&bytes[..2], (key.len() as u16).to_le_bytes());
        assert_eq!(&bytes[2..2 + key.len()], key.as_slice());

        let rest = &bytes[2 + key.len()..];
        let block_len = u32::from_le_bytes(rest[..4].try_into().unwrap()) as usize;
        assert_eq!(rest.len(), 4 + block_len);
    }

    #[test]
    fn key_below_limit_is_accepted() {
        // table "t": 2 bytes, text tag + 3-byte varint length: 4 bytes.
        let text = "x".repeat(MAX_PRIMARY_KEY_SIZE - 7);
        let key = encode_key("t", &Value::Text(text.clone())).unwrap();
        assert_eq!(key.len(), MAX_PRIMARY_KEY_SIZE - 1);

        let row = Row::with_table("t", text);
        let bytes = row.to_bytes().unwrap();
        assert_eq!(Row::decode(&mut bytes.as_slice()).unwrap(), row);
    }

    #[test]
    fn key_at_limit_is_rejected() {
        let text = "x".repeat(MAX_PRIMARY_KEY_SIZE - 6);
        let res = encode_key("t", &Value::Text(text.clone()));
        assert!(matches!(
            res,
            Err(CodecError::KeyTooLarge { size: MAX_PRIMARY_KEY_SIZE, .. })
        ));

        let res = Row::with_table("t", text).to_bytes();
        assert!(matches!(res, Err(CodecError::KeyTooLarge { .. })));
    }

    #[test]
    #[should_panic(expected = "KeyTooLarge")]
    fn oversized_key_is_rejected() {
        let row = Row::with_table("users", "x".repeat(MAX_PRIMARY_KEY_SIZE));
        row.to_bytes().unwrap();
    }

    #[test]
    fn long_names_round_trip() {
        let table = "t".repeat(200);
        let column = "c".repeat(300);
        let row = Row::with_table(table.as_str(), 1i32).add_column(column.as_str(), "v");
        let bytes = row.to_bytes().unwrap();

        // Key block starts with the table name behind a two-byte length.
        assert_eq!(&bytes[2..5], [0xc8, 0x01, b't']);
        assert_eq!(Row::decode(&mut bytes.as_slice()).unwrap(), row);
    }

    #[test]
    fn decode_many_rows() {
        let mut bytes = Vec::new();
        for id in 0..3 {
            user(id).encode_into(&mut bytes).unwrap();
        }

        let rows = decode_rows(&bytes).unwrap();
        assert_eq!(rows, vec![user(0), user(1), user(2)]);
    }

    #[test]
    fn decode_truncated_row() {
        let bytes = user(1).to_bytes().unwrap();
        let res = decode_rows(&bytes[..bytes.len() - 1]);

        assert!(matches!(
            res,
            Err(CodecError::Truncated {
                field: "column block",
                ..
            })
        ));
    }

    #[test]
    fn display_row() {
        let row = Row::with_table("T", 1i32).add_column("a", "b");
        assert_eq!(row.to_string(), "T[1] { a: \"b\" }");
    }
}

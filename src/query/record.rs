//! Field records: the serialized form of keys and values that carry
//! queryable fields.
//!
//! A record is a sequence of fields, each laid out as
//!
//! ```text
//! name_len: u16 BE | name: utf-8 | tag: u8 | value_len: u32 BE | value
//! ```
//!
//! Nested objects are fields of type [`FieldType::Record`] whose value is
//! itself a record.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Bool,
    I64,
    F64,
    String,
    Bytes,
    Record,
}

impl FieldType {
    fn tag(self) -> u8 {
        match self {
            FieldType::Bool => 1,
            FieldType::I64 => 2,
            FieldType::F64 => 3,
            FieldType::String => 4,
            FieldType::Bytes => 5,
            FieldType::Record => 6,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => FieldType::Bool,
            2 => FieldType::I64,
            3 => FieldType::F64,
            4 => FieldType::String,
            5 => FieldType::Bytes,
            6 => FieldType::Record,
            _ => return None,
        })
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Bool => "bool",
            FieldType::I64 => "i64",
            FieldType::F64 => "f64",
            FieldType::String => "string",
            FieldType::Bytes => "bytes",
            FieldType::Record => "record",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Bytes(Bytes),
    Record(Bytes),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Bool(_) => FieldType::Bool,
            FieldValue::I64(_) => FieldType::I64,
            FieldValue::F64(_) => FieldType::F64,
            FieldValue::String(_) => FieldType::String,
            FieldValue::Bytes(_) => FieldType::Bytes,
            FieldValue::Record(_) => FieldType::Record,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            FieldValue::Bool(v) => buf.put_u8(u8::from(*v)),
            FieldValue::I64(v) => buf.put_i64(*v),
            FieldValue::F64(v) => buf.put_f64(*v),
            FieldValue::String(v) => buf.put_slice(v.as_bytes()),
            FieldValue::Bytes(v) | FieldValue::Record(v) => buf.put_slice(v),
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            FieldValue::Bool(_) => 1,
            FieldValue::I64(_) | FieldValue::F64(_) => 8,
            FieldValue::String(v) => v.len(),
            FieldValue::Bytes(v) | FieldValue::Record(v) => v.len(),
        }
    }

    pub fn decode(field_type: FieldType, data: &[u8]) -> Result<Self> {
        let fixed = |len: usize| -> Result<[u8; 8]> {
            if data.len() != len {
                return Err(Error::InvalidRecord(format!(
                    "{} value of {} bytes",
                    field_type,
                    data.len()
                )));
            }
            let mut out = [0u8; 8];
            out[..len].copy_from_slice(data);
            Ok(out)
        };

        Ok(match field_type {
            FieldType::Bool => FieldValue::Bool(fixed(1)?[0] != 0),
            FieldType::I64 => FieldValue::I64(i64::from_be_bytes(fixed(8)?)),
            FieldType::F64 => FieldValue::F64(f64::from_be_bytes(fixed(8)?)),
            FieldType::String => FieldValue::String(
                std::str::from_utf8(data)
                    .map_err(|e| Error::InvalidRecord(e.to_string()))?
                    .to_string(),
            ),
            FieldType::Bytes => FieldValue::Bytes(Bytes::copy_from_slice(data)),
            FieldType::Record => FieldValue::Record(Bytes::copy_from_slice(data)),
        })
    }
}

/// Location of one field inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpan<'a> {
    pub name: &'a str,
    pub field_type: FieldType,
    /// Offset of the field header.
    pub start: usize,
    /// Offset of the value bytes.
    pub value_offset: usize,
    pub value_len: usize,
}

impl<'a> FieldSpan<'a> {
    pub fn end(&self) -> usize {
        self.value_offset + self.value_len
    }

    pub fn value<'r>(&self, record: &'r [u8]) -> &'r [u8] {
        &record[self.value_offset..self.end()]
    }
}

/// Parse every field of a record.
pub fn fields(record: &[u8]) -> Result<Vec<FieldSpan<'_>>> {
    let truncated = |at: usize| Error::InvalidRecord(format!("truncated field at offset {}", at));

    let mut spans = Vec::new();
    let mut pos = 0;
    while pos < record.len() {
        let start = pos;
        let header = record.get(pos..pos + 2).ok_or_else(|| truncated(start))?;
        let name_len = u16::from_be_bytes([header[0], header[1]]) as usize;
        pos += 2;

        let name = record
            .get(pos..pos + name_len)
            .ok_or_else(|| truncated(start))?;
        let name = std::str::from_utf8(name).map_err(|e| Error::InvalidRecord(e.to_string()))?;
        pos += name_len;

        let tag = *record.get(pos).ok_or_else(|| truncated(start))?;
        let field_type = FieldType::from_tag(tag)
            .ok_or_else(|| Error::InvalidRecord(format!("unknown type tag {}", tag)))?;
        pos += 1;

        let len = record.get(pos..pos + 4).ok_or_else(|| truncated(start))?;
        let value_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
        pos += 4;

        if pos + value_len > record.len() {
            return Err(truncated(start));
        }
        spans.push(FieldSpan {
            name,
            field_type,
            start,
            value_offset: pos,
            value_len,
        });
        pos += value_len;
    }
    Ok(spans)
}

pub fn find<'a>(record: &'a [u8], name: &str) -> Result<Option<FieldSpan<'a>>> {
    Ok(fields(record)?.into_iter().find(|f| f.name == name))
}

/// Read a field's value.
pub fn read(record: &[u8], name: &str) -> Result<Option<FieldValue>> {
    match find(record, name)? {
        Some(span) => FieldValue::decode(span.field_type, span.value(record)).map(Some),
        None => Ok(None),
    }
}

/// Copy of `record` with the field set to `value`, appended if absent.
pub fn write(record: &[u8], name: &str, value: &FieldValue) -> Result<Bytes> {
    let existing = find(record, name)?;
    let mut buf = BytesMut::with_capacity(record.len() + name.len() + 7 + value.encoded_len());
    match existing {
        Some(span) => {
            buf.put_slice(&record[..span.start]);
            encode_field(&mut buf, name, value)?;
            buf.put_slice(&record[span.end()..]);
        }
        None => {
            buf.put_slice(record);
            encode_field(&mut buf, name, value)?;
        }
    }
    Ok(buf.freeze())
}

fn encode_field(buf: &mut BytesMut, name: &str, value: &FieldValue) -> Result<()> {
    let name_len = u16::try_from(name.len())
        .map_err(|_| Error::InvalidRecord(format!("field name too long: {}", name.len())))?;
    let value_len = u32::try_from(value.encoded_len())
        .map_err(|_| Error::InvalidRecord("field value too long".to_string()))?;
    buf.put_u16(name_len);
    buf.put_slice(name.as_bytes());
    buf.put_u8(value.field_type().tag());
    buf.put_u32(value_len);
    value.encode(buf);
    Ok(())
}

/// Builds a record field by field.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    buf: BytesMut,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, value: FieldValue) -> Result<Self> {
        encode_field(&mut self.buf, name, &value)?;
        Ok(self)
    }

    pub fn build(self) -> Bytes {
        self.buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Bytes {
        RecordBuilder::new()
            .field("name", FieldValue::String("ann".into()))
            .unwrap()
            .field("age", FieldValue::I64(41))
            .unwrap()
            .field("active", FieldValue::Bool(true))
            .unwrap()
            .build()
    }

    #[test]
    fn test_layout() {
        let record = person();
        let spans = fields(&record).unwrap();
        assert_eq!(spans.len(), 3);

        // 2 bytes name length, "name", tag, 4 bytes value length.
        assert_eq!(spans[0].value_offset, 2 + 4 + 1 + 4);
        assert_eq!(spans[0].value(&record), b"ann");
        assert_eq!(spans[1].start, spans[0].end());
        assert_eq!(spans[1].field_type, FieldType::I64);
    }

    #[test]
    fn test_read_and_write() {
        let record = person();
        assert_eq!(read(&record, "age").unwrap(), Some(FieldValue::I64(41)));
        assert_eq!(read(&record, "missing").unwrap(), None);

        let older = write(&record, "age", &FieldValue::I64(42)).unwrap();
        assert_eq!(read(&older, "age").unwrap(), Some(FieldValue::I64(42)));
        assert_eq!(read(&older, "name").unwrap(), Some(FieldValue::String("ann".into())));
        assert_eq!(read(&older, "active").unwrap(), Some(FieldValue::Bool(true)));

        let extended = write(&record, "score", &FieldValue::F64(0.5)).unwrap();
        assert_eq!(fields(&extended).unwrap().len(), 4);
        assert_eq!(read(&extended, "score").unwrap(), Some(FieldValue::F64(0.5)));
    }

    #[test]
    fn test_malformed_records() {
        let record = person();
        assert!(fields(&record[..record.len() - 1]).is_err());
        assert!(fields(&[0, 1, b'x', 99, 0, 0, 0, 0]).is_err());
        assert!(FieldValue::decode(FieldType::I64, &[1, 2]).is_err());
        assert!(fields(&[]).unwrap().is_empty());
    }
}

//! Accessors for configured query fields.

use super::record::{self, FieldType, FieldValue};
use crate::config::QueryField;
use crate::error::{Error, Result};
use bytes::Bytes;

/// Reads and writes one query field of serialized entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryProperty {
    name: String,
    /// Field names from the outermost record inwards.
    path: Vec<String>,
    field_type: FieldType,
    key: bool,
}

impl QueryProperty {
    pub fn new(field: &QueryField) -> Self {
        Self {
            name: field.name.clone(),
            path: field.name.split('.').map(str::to_string).collect(),
            field_type: field.field_type,
            key: field.key_field,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    /// Whether the field is read from the key rather than the value.
    pub fn is_key(&self) -> bool {
        self.key
    }

    fn span<'a>(&self, key: &'a [u8], value: &'a [u8]) -> &'a [u8] {
        if self.key {
            key
        } else {
            value
        }
    }

    /// Value of the field in an entry, absent if any path segment is missing.
    pub fn value(&self, key: &[u8], value: &[u8]) -> Result<Option<FieldValue>> {
        let Some((offset, field_type, len)) = self.locate(self.span(key, value))? else {
            return Ok(None);
        };
        if field_type != self.field_type {
            return Err(self.type_mismatch(field_type));
        }
        FieldValue::decode(field_type, &self.span(key, value)[offset..offset + len]).map(Some)
    }

    /// Entry with the field set, creating missing nested records.
    pub fn set_value(&self, key: &[u8], value: &[u8], new: FieldValue) -> Result<(Bytes, Bytes)> {
        if new.field_type() != self.field_type {
            return Err(self.type_mismatch(new.field_type()));
        }
        let updated = write_path(self.span(key, value), &self.path, &new)?;
        if self.key {
            Ok((updated, Bytes::copy_from_slice(value)))
        } else {
            Ok((Bytes::copy_from_slice(key), updated))
        }
    }

    /// Byte offset of the field's value inside the key or value span.
    pub fn property_offset(&self, key: &[u8], value: &[u8]) -> Result<Option<usize>> {
        Ok(self
            .locate(self.span(key, value))?
            .map(|(offset, _, _)| offset))
    }

    /// Absolute offset, type and length of the field's value in `span`.
    fn locate(&self, span: &[u8]) -> Result<Option<(usize, FieldType, usize)>> {
        let mut base = 0;
        let mut current = span;
        let last = self.path.len() - 1;

        for (depth, segment) in self.path.iter().enumerate() {
            let Some(field) = record::find(current, segment)? else {
                return Ok(None);
            };
            if depth == last {
                return Ok(Some((
                    base + field.value_offset,
                    field.field_type,
                    field.value_len,
                )));
            }
            if field.field_type != FieldType::Record {
                return Err(Error::InvalidRecord(format!(
                    "{}: {} is not a record",
                    self.name, segment
                )));
            }
            base += field.value_offset;
            current = field.value(current);
        }
        Ok(None)
    }

    fn type_mismatch(&self, found: FieldType) -> Error {
        Error::InvalidRecord(format!(
            "{}: expected {}, found {}",
            self.name, self.field_type, found
        ))
    }
}

fn write_path(record: &[u8], path: &[String], value: &FieldValue) -> Result<Bytes> {
    match path {
        [] => Err(Error::InvalidRecord("empty field path".to_string())),
        [name] => record::write(record, name, value),
        [name, rest @ ..] => {
            let inner = match record::find(record, name)? {
                Some(field) if field.field_type == FieldType::Record => {
                    field.value(record).to_vec()
                }
                Some(_) => {
                    return Err(Error::InvalidRecord(format!("{} is not a record", name)));
                }
                None => Vec::new(),
            };
            let nested = write_path(&inner, rest, value)?;
            record::write(record, name, &FieldValue::Record(nested))
        }
    }
}

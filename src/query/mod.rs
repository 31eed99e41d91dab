//! Query field access on serialized entries.
//!
//! Caches declare query fields in their configuration. Each becomes a
//! [`QueryProperty`] that reads, writes or locates the field inside the
//! serialized key or value, which are encoded as field records.

mod property;
pub mod record;

pub use property::QueryProperty;
pub use record::{FieldSpan, FieldType, FieldValue, RecordBuilder};

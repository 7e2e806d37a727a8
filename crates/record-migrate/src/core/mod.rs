//! Core data model: values, rows, and schema metadata.

pub mod schema;
pub mod value;

pub use schema::{EntityField, EntitySchema, FieldType, SourceColumn, SourceTable};
pub use value::{record_from_json, Record, Value};

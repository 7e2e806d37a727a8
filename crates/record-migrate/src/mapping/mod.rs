//! Table and field mapping definitions plus auto-suggestion scoring.

pub mod field;
pub mod suggest;
pub mod table;

pub use field::{FieldMapping, FieldState, LookupConfig, MappingType};
pub use table::{MappingState, MigrationState, TableMapping};

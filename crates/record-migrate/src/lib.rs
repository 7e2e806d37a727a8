//! Record migration engine: moves rows from arbitrary relational sources
//! into an object-relational target system.
//!
//! The engine is built around a handful of cooperating pieces:
//!
//! - [`registry::Registry`] discovers source tables, tracks their mappings
//!   and topics, and orchestrates runs in dependency order.
//! - [`mapping`] holds table and field mapping rules, with name-similarity
//!   suggestion so operators start from a mostly-filled sheet.
//! - [`resolver`] orders mapped tables so referenced entities load first,
//!   and groups them into layers that can run in parallel.
//! - [`transform`] turns source rows into target records: named transform
//!   functions, a sandboxed expression language, and foreign-key lookups
//!   that consult the identity map before searching natural keys.
//! - [`identity`] durably links source primary keys to target ids, making
//!   re-runs idempotent (update instead of duplicate).
//! - [`loader`] streams batches with per-row error isolation; failed rows
//!   land in the [`quarantine`] for bounded retries.
//!
//! Source and target systems plug in through the [`connect`] traits; the
//! engine itself never speaks a concrete wire protocol.

pub mod config;
pub mod connect;
pub mod core;
pub mod error;
pub mod identity;
pub mod loader;
pub mod mapping;
pub mod quarantine;
pub mod registry;
pub mod resolver;
pub mod transform;

pub use config::{Config, MigrationConfig};
pub use connect::{Cursor, RowPage, SourceConnector, TargetStore};
pub use core::{EntityField, EntitySchema, FieldType, Record, SourceColumn, SourceTable, Value};
pub use error::{ErrorKind, MigrateError, Result};
pub use identity::IdentityMap;
pub use loader::{BatchLoader, BatchOutcome, Control};
pub use mapping::{FieldMapping, LookupConfig, MappingType, TableMapping};
pub use quarantine::{ErrorRecord, Quarantine, QuarantineState};
pub use registry::{
    Controller, EntityCatalog, MigrationReport, Project, Registry, RunStatus, TopicProgress,
};
pub use resolver::{DependencyIssue, DependencyResolver, MigrationOrder};
pub use transform::{Expression, FieldTransformer, LookupOutcome};

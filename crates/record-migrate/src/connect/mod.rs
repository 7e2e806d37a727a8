//! Connector traits for the source system and the target store.
//!
//! The engine never talks to a concrete database or ORM. It consumes these
//! two narrow interfaces, injected explicitly into the components that need
//! them. Implementations live outside the crate (tests ship in-memory fakes).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{EntitySchema, Record, SourceColumn, SourceTable, Value};
use crate::error::Result;

/// Opaque, resumable paging cursor owned by the source connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor(pub String);

/// One page of source rows.
#[derive(Debug, Clone)]
pub struct RowPage {
    /// Rows in this page.
    pub rows: Vec<Record>,

    /// Cursor for the next page, or `None` when the table is exhausted.
    pub next: Option<Cursor>,
}

impl RowPage {
    /// An empty, final page.
    pub fn empty() -> Self {
        Self {
            rows: Vec::new(),
            next: None,
        }
    }
}

/// Read schema and rows from an arbitrary relational source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// List the tables visible to this connection.
    async fn list_tables(&self) -> Result<Vec<SourceTable>>;

    /// Describe the columns of one table.
    async fn describe_table(&self, table: &str) -> Result<Vec<SourceColumn>>;

    /// Fetch up to `limit` rows, resuming from `cursor` when given.
    ///
    /// Returns the page plus the cursor for the next call; a `None` cursor in
    /// the result means the table is exhausted.
    async fn fetch_rows(
        &self,
        table: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<RowPage>;
}

/// Create, update and search records in the target object-relational system.
#[async_trait]
pub trait TargetStore: Send + Sync {
    /// Describe an entity type, including relation metadata on its fields.
    async fn describe_schema(&self, entity_type: &str) -> Result<EntitySchema>;

    /// Find record ids where `field` equals `value`.
    async fn search(&self, entity_type: &str, field: &str, value: &Value) -> Result<Vec<i64>>;

    /// Create a record and return its id.
    async fn create(&self, entity_type: &str, fields: Record) -> Result<i64>;

    /// Update an existing record.
    async fn update(&self, entity_type: &str, id: i64, fields: Record) -> Result<()>;

    /// Total record count for an entity type.
    async fn count(&self, entity_type: &str) -> Result<i64>;
}

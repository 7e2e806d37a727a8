//! Table mapping: binds one source table to one target entity type and
//! tracks its migration state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{EntitySchema, SourceColumn, SourceTable};
use crate::error::{MigrateError, Result};

use super::field::FieldMapping;
use super::suggest;

/// Mapping lifecycle: `Pending → Suggested → Mapped → {Ignored | Error}`,
/// with `Mapped → Pending` via reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingState {
    #[default]
    Pending,
    Suggested,
    Mapped,
    Ignored,
    Error,
}

/// Migration execution state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

/// The binding of one source table to one target entity type, plus its
/// field mappings and migration progress. `(project, source_table)` is
/// unique within a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapping {
    /// Source table name.
    pub source_table: String,

    /// Source schema name.
    pub source_schema: String,

    /// Row count reported at discovery time.
    pub row_count: i64,

    /// Source column metadata captured at discovery.
    pub columns: Vec<SourceColumn>,

    /// Semantic grouping used to stage which tables get attention first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// Target entity type bound at mapping time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_entity_type: Option<String>,

    /// Suggested target entity type awaiting acceptance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_entity_type: Option<String>,

    /// Suggested topic awaiting acceptance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_topic: Option<String>,

    /// Confidence of the suggestion, 0..=1.
    #[serde(default)]
    pub suggestion_confidence: f64,

    /// Mapping lifecycle state.
    #[serde(default)]
    pub state: MappingState,

    /// Migration execution state.
    #[serde(default)]
    pub migration_state: MigrationState,

    /// Field mapping rules, unique per source column.
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,

    /// Per-table batch size override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Rows migrated so far.
    #[serde(default)]
    pub migrated_records: i64,

    /// Rows quarantined so far.
    #[serde(default)]
    pub error_records: i64,

    /// Last error for `migration_state == Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the table finished migrating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TableMapping {
    /// Create a mapping at schema-discovery time.
    pub fn discovered(table: &SourceTable, columns: Vec<SourceColumn>) -> Self {
        Self {
            source_table: table.name.clone(),
            source_schema: table.schema.clone(),
            row_count: table.row_count,
            columns,
            topic: None,
            target_entity_type: None,
            suggested_entity_type: None,
            suggested_topic: None,
            suggestion_confidence: 0.0,
            state: MappingState::Pending,
            migration_state: MigrationState::Pending,
            field_mappings: Vec::new(),
            batch_size: None,
            migrated_records: 0,
            error_records: 0,
            error: None,
            completed_at: None,
        }
    }

    /// Record a suggestion for this table; moves `Pending → Suggested`.
    pub fn suggest(&mut self, entity_type: impl Into<String>, topic: Option<String>, confidence: f64) {
        self.suggested_entity_type = Some(entity_type.into());
        self.suggested_topic = topic;
        self.suggestion_confidence = confidence;
        if self.state == MappingState::Pending {
            self.state = MappingState::Suggested;
        }
    }

    /// Accept the pending suggestion: promotes `Suggested → Mapped`, binds
    /// the target entity type, and auto-generates field mappings against
    /// the target schema.
    pub fn accept_suggestion(&mut self, schema: &EntitySchema, threshold: f64) -> Result<()> {
        let entity_type = self.suggested_entity_type.clone().ok_or_else(|| {
            MigrateError::Config(format!(
                "table {} has no suggestion to accept",
                self.source_table
            ))
        })?;
        if schema.entity_type != entity_type {
            return Err(MigrateError::Config(format!(
                "schema {} does not match suggested entity type {}",
                schema.entity_type, entity_type
            )));
        }
        if self.suggested_topic.is_some() {
            self.topic = self.suggested_topic.clone();
        }
        self.bind(entity_type, schema, threshold);
        Ok(())
    }

    /// Bind a target entity type directly (operator override) and
    /// auto-generate field mappings.
    pub fn bind(&mut self, entity_type: impl Into<String>, schema: &EntitySchema, threshold: f64) {
        self.target_entity_type = Some(entity_type.into());
        self.state = MappingState::Mapped;
        self.field_mappings = suggest::generate_field_mappings(&self.columns, schema, threshold);
    }

    /// Mark the table ignored; it no longer participates in migration.
    pub fn set_ignored(&mut self) {
        self.state = MappingState::Ignored;
    }

    /// Reset the mapping back to `Pending`, dropping the binding and all
    /// field mappings.
    pub fn reset(&mut self) {
        self.state = MappingState::Pending;
        self.migration_state = MigrationState::Pending;
        self.topic = None;
        self.target_entity_type = None;
        self.field_mappings.clear();
        self.migrated_records = 0;
        self.error_records = 0;
        self.error = None;
        self.completed_at = None;
    }

    /// Source columns declared as primary key via field mappings, falling
    /// back to column metadata when no mapping declares one.
    pub fn pk_columns(&self) -> Vec<&str> {
        let from_mappings: Vec<&str> = self
            .field_mappings
            .iter()
            .filter(|fm| fm.source_is_pk)
            .map(|fm| fm.source_column.as_str())
            .collect();
        if !from_mappings.is_empty() {
            return from_mappings;
        }
        self.columns
            .iter()
            .filter(|c| c.is_primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Whether this table participates in a migration run.
    pub fn is_runnable(&self) -> bool {
        self.state == MappingState::Mapped && self.target_entity_type.is_some()
    }

    /// Migration progress in percent.
    pub fn progress(&self) -> f64 {
        if self.row_count > 0 {
            (self.migrated_records as f64 / self.row_count as f64) * 100.0
        } else {
            0.0
        }
    }

    pub fn mark_running(&mut self) {
        self.migration_state = MigrationState::Running;
    }

    pub fn mark_completed(&mut self) {
        self.migration_state = MigrationState::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.migration_state = MigrationState::Error;
        self.error = Some(message.into());
    }
}

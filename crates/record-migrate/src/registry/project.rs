//! Project state document: every table mapping of one migration project,
//! persisted as JSON so runs can stop and resume.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{MigrateError, Result};
use crate::mapping::{MigrationState, TableMapping};

/// Persistent state of one migration project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project name; scopes identity mappings and quarantine records.
    pub name: String,

    /// Hash of the config the mappings were built under, for resume checks.
    pub config_hash: String,

    /// All discovered tables with their mappings. `source_table` is unique.
    pub tables: Vec<TableMapping>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, config_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            config_hash: config_hash.into(),
            tables: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Load project state from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let project: Project = serde_json::from_str(&content)?;
        debug!(
            project = %project.name,
            tables = project.tables.len(),
            "Loaded project state"
        );
        Ok(project)
    }

    /// Persist project state (atomic write: temp file, then rename).
    pub fn save(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(self)?;
        let path = path.as_ref();
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Reconcile the stored config hash with the active config. A mismatch
    /// is logged and the hash refreshed; mappings built under the old
    /// config survive but the operator is told the ground shifted.
    pub fn check_config(&mut self, config: &Config) -> Result<()> {
        if config.project != self.name {
            return Err(MigrateError::State(format!(
                "project state belongs to {}, config says {}",
                self.name, config.project
            )));
        }
        let hash = config.hash();
        if self.config_hash != hash {
            warn!(
                project = %self.name,
                "Configuration changed since the last run, keeping existing mappings"
            );
            self.config_hash = hash;
        }
        Ok(())
    }

    pub fn table(&self, source_table: &str) -> Option<&TableMapping> {
        self.tables.iter().find(|t| t.source_table == source_table)
    }

    pub fn table_mut(&mut self, source_table: &str) -> Option<&mut TableMapping> {
        self.tables
            .iter_mut()
            .find(|t| t.source_table == source_table)
    }

    /// Insert or replace a table mapping, keyed by source table name.
    pub fn upsert_table(&mut self, mapping: TableMapping) {
        match self.table_mut(&mapping.source_table) {
            Some(existing) => *existing = mapping,
            None => self.tables.push(mapping),
        }
    }

    /// Mapped tables that participate in a run.
    pub fn runnable_tables(&self) -> Vec<&TableMapping> {
        self.tables.iter().filter(|t| t.is_runnable()).collect()
    }

    /// Tables already migrated, skipped on resume.
    pub fn completed_tables(&self) -> Vec<&str> {
        self.tables
            .iter()
            .filter(|t| t.migration_state == MigrationState::Completed)
            .map(|t| t.source_table.as_str())
            .collect()
    }

    /// Distinct topics across tables, sorted, for operator grouping.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .tables
            .iter()
            .filter_map(|t| t.topic.clone())
            .collect();
        topics.sort();
        topics.dedup();
        topics
    }

    /// Tables grouped under one topic.
    pub fn tables_for_topic(&self, topic: &str) -> Vec<&TableMapping> {
        self.tables
            .iter()
            .filter(|t| t.topic.as_deref() == Some(topic))
            .collect()
    }

    /// Aggregated counters per topic.
    pub fn topic_progress(&self) -> Vec<TopicProgress> {
        self.topics()
            .into_iter()
            .map(|topic| {
                let tables = self.tables_for_topic(&topic);
                TopicProgress {
                    tables: tables.len(),
                    row_count: tables.iter().map(|t| t.row_count).sum(),
                    migrated_records: tables.iter().map(|t| t.migrated_records).sum(),
                    error_records: tables.iter().map(|t| t.error_records).sum(),
                    topic,
                }
            })
            .collect()
    }
}

/// Migration counters rolled up over every table of one topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicProgress {
    pub topic: String,
    pub tables: usize,
    pub row_count: i64,
    pub migrated_records: i64,
    pub error_records: i64,
}

//! Error quarantine: failed rows are captured with their payload and a
//! classified error, durable across runs, and individually retryable.
//!
//! A quarantined row never blocks the rest of its batch. Retries are
//! bounded; rows that exhaust their budget stay `Pending` for an operator
//! to fix or ignore.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::Record;
use crate::error::{ErrorKind, MigrateError, Result};

/// Review state of one quarantined row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuarantineState {
    /// Awaiting retry or operator attention.
    #[default]
    Pending,
    /// A later retry migrated the row successfully.
    Retried,
    /// An operator marked the row as not worth migrating.
    Ignored,
}

/// One failed row with enough context to reproduce and retry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Stable id for operator workflows.
    pub id: Uuid,

    /// Project the failure belongs to.
    pub project: String,

    /// Source table the row came from.
    pub source_table: String,

    /// Source primary key, stringified ("?" when the table has none).
    pub source_id: String,

    /// Full source row snapshot at failure time.
    pub row: Record,

    /// Error classification.
    pub kind: ErrorKind,

    /// Human-readable error message.
    pub message: String,

    /// Retries attempted so far.
    pub retry_count: u32,

    /// Retry budget.
    pub max_retries: u32,

    /// Review state.
    pub state: QuarantineState,

    /// When the row was first quarantined.
    pub created_at: DateTime<Utc>,

    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl ErrorRecord {
    /// Whether a retry is still allowed.
    pub fn can_retry(&self) -> bool {
        self.state == QuarantineState::Pending && self.retry_count < self.max_retries
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    project: String,
    records: Vec<ErrorRecord>,
}

/// Durable store of quarantined rows for one project. Shared across table
/// workers; persists as pretty JSON with an atomic temp-file + rename save.
pub struct Quarantine {
    project: String,
    path: Option<PathBuf>,
    max_retries: u32,
    records: RwLock<HashMap<Uuid, ErrorRecord>>,
}

impl Quarantine {
    /// Create an empty in-memory quarantine.
    pub fn new(project: impl Into<String>, max_retries: u32) -> Self {
        Self {
            project: project.into(),
            path: None,
            max_retries,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a snapshot file used by [`save`](Self::save).
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Load a snapshot from disk. A missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>, project: &str, max_retries: u32) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(project, max_retries).with_path(path));
        }

        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.project != project {
            return Err(MigrateError::State(format!(
                "quarantine belongs to project {}, expected {}",
                snapshot.project, project
            )));
        }

        let records = snapshot
            .records
            .into_iter()
            .map(|r| (r.id, r))
            .collect();

        Ok(Self {
            project: project.to_string(),
            path: Some(path.to_path_buf()),
            max_retries,
            records: RwLock::new(records),
        })
    }

    /// Quarantine one failed row and return its id.
    pub fn capture(
        &self,
        source_table: &str,
        source_id: &str,
        row: Record,
        error: &MigrateError,
    ) -> Uuid {
        let now = Utc::now();
        let record = ErrorRecord {
            id: Uuid::new_v4(),
            project: self.project.clone(),
            source_table: source_table.to_string(),
            source_id: source_id.to_string(),
            row,
            kind: error.kind(),
            message: error.to_string(),
            retry_count: 0,
            max_retries: self.max_retries,
            state: QuarantineState::Pending,
            created_at: now,
            updated_at: now,
        };
        let id = record.id;
        debug!(
            table = %source_table,
            source_id = %source_id,
            kind = %record.kind,
            "Quarantined row: {}",
            record.message
        );
        self.records
            .write()
            .expect("quarantine lock poisoned")
            .insert(id, record);
        id
    }

    /// Fetch a record by id.
    pub fn get(&self, id: Uuid) -> Option<ErrorRecord> {
        self.records
            .read()
            .expect("quarantine lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Pending records for one table, oldest first. These are the retry
    /// candidates for a re-run.
    pub fn pending_for_table(&self, source_table: &str) -> Vec<ErrorRecord> {
        let mut out: Vec<ErrorRecord> = self
            .records
            .read()
            .expect("quarantine lock poisoned")
            .values()
            .filter(|r| r.state == QuarantineState::Pending && r.source_table == source_table)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        out
    }

    /// Count of pending records across all tables.
    pub fn pending_count(&self) -> usize {
        self.records
            .read()
            .expect("quarantine lock poisoned")
            .values()
            .filter(|r| r.state == QuarantineState::Pending)
            .count()
    }

    /// Record a retry attempt. A successful retry resolves the record; a
    /// failed one bumps the attempt counter and refreshes the error.
    pub fn record_retry(&self, id: Uuid, outcome: std::result::Result<(), &MigrateError>) -> Result<()> {
        let mut records = self.records.write().expect("quarantine lock poisoned");
        let record = records.get_mut(&id).ok_or_else(|| {
            MigrateError::State(format!("no quarantined record with id {id}"))
        })?;
        record.updated_at = Utc::now();
        match outcome {
            Ok(()) => record.state = QuarantineState::Retried,
            Err(e) => {
                record.retry_count += 1;
                record.kind = e.kind();
                record.message = e.to_string();
            }
        }
        Ok(())
    }

    /// Operator action: stop retrying this row.
    pub fn ignore(&self, id: Uuid) -> Result<()> {
        let mut records = self.records.write().expect("quarantine lock poisoned");
        let record = records.get_mut(&id).ok_or_else(|| {
            MigrateError::State(format!("no quarantined record with id {id}"))
        })?;
        record.state = QuarantineState::Ignored;
        record.updated_at = Utc::now();
        Ok(())
    }

    /// Counts per error kind over pending records, for reporting.
    pub fn pending_by_kind(&self) -> HashMap<ErrorKind, usize> {
        let records = self.records.read().expect("quarantine lock poisoned");
        let mut out = HashMap::new();
        for r in records.values() {
            if r.state == QuarantineState::Pending {
                *out.entry(r.kind).or_insert(0) += 1;
            }
        }
        out
    }

    /// Persist the snapshot (atomic write: temp file, then rename).
    /// A store without an attached path is memory-only and saves are no-ops.
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let mut records: Vec<ErrorRecord> = {
            let guard = self.records.read().expect("quarantine lock poisoned");
            guard.values().cloned().collect()
        };
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let snapshot = Snapshot {
            project: self.project.clone(),
            records,
        };
        let content = serde_json::to_string_pretty(&snapshot)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

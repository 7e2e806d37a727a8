//! Identity map store: durable links from source primary keys to the target
//! ids they were migrated to. The map is what makes re-runs idempotent.
//!
//! The store is shared across table workers; a `RwLock` serializes writes so
//! a given `(source_table, source_id)` key can never lose an update. The
//! snapshot persists as pretty JSON with an atomic temp-file + rename save.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{MigrateError, Result};

/// One durable mapping from a source row to its migrated target record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityMapEntry {
    /// Source table the row came from.
    pub source_table: String,

    /// Source primary key, stringified.
    pub source_id: String,

    /// Target entity type the row became.
    pub target_entity_type: String,

    /// Target record id.
    pub target_id: i64,

    /// When the mapping was first recorded.
    pub created_at: DateTime<Utc>,
}

/// On-disk snapshot format.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    project: String,
    entries: Vec<IdentityMapEntry>,
}

/// Durable map from `(source_table, source_id)` to `(entity_type, target_id)`
/// for one project. Entries are upserted, never silently deleted.
pub struct IdentityMap {
    project: String,
    path: Option<PathBuf>,
    entries: RwLock<HashMap<(String, String), IdentityMapEntry>>,
}

impl IdentityMap {
    /// Create an empty in-memory map for a project.
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            path: None,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a snapshot file used by [`save`](Self::save).
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Load a snapshot from disk. A missing file yields an empty map.
    pub fn load(path: impl AsRef<Path>, project: &str) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::new(project).with_path(path));
        }

        let content = std::fs::read_to_string(path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        if snapshot.project != project {
            return Err(MigrateError::State(format!(
                "identity map belongs to project {}, expected {}",
                snapshot.project, project
            )));
        }

        let entries = snapshot
            .entries
            .into_iter()
            .map(|e| ((e.source_table.clone(), e.source_id.clone()), e))
            .collect();

        Ok(Self {
            project: project.to_string(),
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
        })
    }

    /// Project this map is scoped to.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Resolve the target id for a source row, if it was migrated before.
    pub fn get(&self, source_table: &str, source_id: &str) -> Option<i64> {
        let entries = self.entries.read().expect("identity map lock poisoned");
        entries
            .get(&(source_table.to_string(), source_id.to_string()))
            .map(|e| e.target_id)
    }

    /// Record (or idempotently re-record) a migrated row.
    pub fn put(
        &self,
        source_table: &str,
        source_id: &str,
        target_entity_type: &str,
        target_id: i64,
    ) {
        let key = (source_table.to_string(), source_id.to_string());
        let mut entries = self.entries.write().expect("identity map lock poisoned");
        entries
            .entry(key)
            .and_modify(|e| {
                e.target_entity_type = target_entity_type.to_string();
                e.target_id = target_id;
            })
            .or_insert_with(|| IdentityMapEntry {
                source_table: source_table.to_string(),
                source_id: source_id.to_string(),
                target_entity_type: target_entity_type.to_string(),
                target_id,
                created_at: Utc::now(),
            });
    }

    /// Bulk view of all mappings for one source table, for batch FK
    /// prefetching.
    pub fn mappings_for_table(&self, source_table: &str) -> HashMap<String, i64> {
        let entries = self.entries.read().expect("identity map lock poisoned");
        entries
            .values()
            .filter(|e| e.source_table == source_table)
            .map(|e| (e.source_id.clone(), e.target_id))
            .collect()
    }

    /// Total number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().expect("identity map lock poisoned").len()
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the snapshot (atomic write: temp file, then rename).
    /// A map without an attached path is memory-only and saves are no-ops.
    pub fn save(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Ok(());
        };

        let mut entries: Vec<IdentityMapEntry> = {
            let guard = self.entries.read().expect("identity map lock poisoned");
            guard.values().cloned().collect()
        };
        entries.sort_by(|a, b| {
            (a.source_table.as_str(), a.source_id.as_str())
                .cmp(&(b.source_table.as_str(), b.source_id.as_str()))
        });

        let snapshot = Snapshot {
            project: self.project.clone(),
            entries,
        };
        let content = serde_json::to_string_pretty(&snapshot)?;

        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;

        debug!("Saved identity map: {} entries", self.len());
        Ok(())
    }
}

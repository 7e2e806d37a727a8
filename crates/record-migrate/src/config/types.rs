//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();
        Self {
            cpu_cores: sys.cpus().len(),
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Project name, used to scope identity mappings and quarantine records.
    pub project: String,

    /// Migration behavior configuration.
    #[serde(default)]
    pub migration: MigrationConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        self.migration = self.migration.with_auto_tuning(&resources);
        self
    }
}

/// Migration behavior configuration.
/// Performance-related fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Rows per batch. Default: 100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,

    /// Parallel table workers within a dependency layer.
    /// Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Maximum retries for a failed or timed-out batch. Default: 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Base delay between batch retries in milliseconds, doubled per
    /// attempt. Default: 500.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,

    /// Timeout for a single batch call in seconds. Default: 120.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_secs: Option<u64>,

    /// Minimum similarity score to accept a suggested field mapping.
    /// Default: 0.5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_threshold: Option<f64>,

    /// Tables to include (exact names). Empty means all.
    #[serde(default)]
    pub include_tables: Vec<String>,

    /// Tables to exclude (exact names).
    #[serde(default)]
    pub exclude_tables: Vec<String>,
}

impl MigrationConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.workers.is_none() {
            let workers = resources.cpu_cores.saturating_sub(2).clamp(2, 16);
            self.workers = Some(workers);
        }

        info!(
            "Auto-tuned config: workers={}, batch_size={}, max_retries={}",
            self.get_workers(),
            self.get_batch_size(),
            self.get_max_retries(),
        );

        self
    }

    pub fn get_batch_size(&self) -> usize {
        self.batch_size.unwrap_or(100)
    }

    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(4)
    }

    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3)
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        self.retry_delay_ms.unwrap_or(500)
    }

    pub fn get_batch_timeout_secs(&self) -> u64 {
        self.batch_timeout_secs.unwrap_or(120)
    }

    pub fn get_suggestion_threshold(&self) -> f64 {
        self.suggestion_threshold.unwrap_or(0.5)
    }

    /// Whether a source table participates in this migration.
    pub fn includes_table(&self, name: &str) -> bool {
        if self.exclude_tables.iter().any(|t| t == name) {
            return false;
        }
        self.include_tables.is_empty() || self.include_tables.iter().any(|t| t == name)
    }
}

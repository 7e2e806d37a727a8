//! Configuration loading and validation.

mod types;

pub use types::*;

use crate::error::{MigrateError, Result};
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() {
            return Err(MigrateError::Config("project name must not be empty".into()));
        }
        if self.migration.get_batch_size() == 0 {
            return Err(MigrateError::Config("batch_size must be at least 1".into()));
        }
        if self.migration.get_workers() == 0 {
            return Err(MigrateError::Config("workers must be at least 1".into()));
        }
        let threshold = self.migration.get_suggestion_threshold();
        if !(0.0..=1.0).contains(&threshold) {
            return Err(MigrateError::Config(format!(
                "suggestion_threshold must be within [0, 1], got {threshold}"
            )));
        }
        Ok(())
    }

    /// Compute a SHA256 hash of the configuration for resume validation.
    pub fn hash(&self) -> String {
        let yaml = serde_yaml::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml() {
        let config = Config::from_yaml("project: legacy-crm\n").unwrap();
        assert_eq!(config.project, "legacy-crm");
        assert_eq!(config.migration.get_batch_size(), 100);
        assert_eq!(config.migration.get_max_retries(), 3);
    }

    #[test]
    fn test_explicit_values_survive() {
        let yaml = "
project: legacy-crm
migration:
  batch_size: 250
  workers: 2
  suggestion_threshold: 0.7
";
        let config = Config::from_yaml(yaml).unwrap().with_auto_tuning();
        assert_eq!(config.migration.get_batch_size(), 250);
        assert_eq!(config.migration.get_workers(), 2);
        assert!((config.migration.get_suggestion_threshold() - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let yaml = "
project: p
migration:
  suggestion_threshold: 1.5
";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_empty_project_rejected() {
        assert!(Config::from_yaml("project: \"\"\n").is_err());
    }

    #[test]
    fn test_hash_changes_with_content() {
        let a = Config::from_yaml("project: a\n").unwrap();
        let b = Config::from_yaml("project: b\n").unwrap();
        assert_ne!(a.hash(), b.hash());
        assert_eq!(a.hash(), a.hash());
    }

    #[test]
    fn test_table_filters() {
        let yaml = "
project: p
migration:
  exclude_tables: [audit_log]
";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.migration.includes_table("customers"));
        assert!(!config.migration.includes_table("audit_log"));

        let yaml = "
project: p
migration:
  include_tables: [customers]
";
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.migration.includes_table("customers"));
        assert!(!config.migration.includes_table("orders"));
    }
}

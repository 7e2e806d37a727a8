//! Error types for the migration engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Source or target schema could not be described.
    #[error("Schema error for {subject}: {message}")]
    Schema { subject: String, message: String },

    /// Transformed value rejected by the target schema.
    #[error("Validation error on {field}: {message}")]
    Validation { field: String, message: String },

    /// Foreign-key resolution or creation failed.
    #[error("Lookup error on {field}: {message}")]
    Lookup { field: String, message: String },

    /// A transform function failed.
    #[error("Transform error on {field}: {message}")]
    Transform { field: String, message: String },

    /// Expression parse or evaluation error.
    #[error("Expression error: {0}")]
    Expression(String),

    /// Target store rejected an operation.
    #[error("Target store error: {0}")]
    Target(String),

    /// Source connector failure.
    #[error("Source connector error: {0}")]
    Source(String),

    /// Persisted state file error.
    #[error("State file error: {0}")]
    State(String),

    /// A batch exceeded its configured timeout.
    #[error("Batch timed out after {seconds}s for table {table}")]
    Timeout { table: String, seconds: u64 },

    /// Migration was cancelled.
    #[error("Migration cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unclassified failures.
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl MigrateError {
    /// Create a Schema error with context about what could not be described.
    pub fn schema(subject: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Schema {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Create a Validation error for a target field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a Lookup error for a target field.
    pub fn lookup(field: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Lookup {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a Transform error for a target field.
    pub fn transform(field: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Transform {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Classify this error for quarantine records.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Schema { .. } | MigrateError::Source(_) => ErrorKind::Schema,
            MigrateError::Validation { .. } => ErrorKind::Validation,
            MigrateError::Lookup { .. } => ErrorKind::Lookup,
            MigrateError::Transform { .. } | MigrateError::Expression(_) => ErrorKind::Transform,
            _ => ErrorKind::Unknown,
        }
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Row-level error classification carried on quarantine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cannot describe or connect to source/target.
    Schema,
    /// Transformed value rejected by the target schema.
    Validation,
    /// FK resolution or creation failed.
    Lookup,
    /// A transform function raised.
    Transform,
    /// Catch-all.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Schema => "schema",
            ErrorKind::Validation => "validation",
            ErrorKind::Lookup => "lookup",
            ErrorKind::Transform => "transform",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

//! Field mapping: the rule for deriving one target field from a source column.

use serde::{Deserialize, Serialize};

use crate::core::Value;

/// How a source column maps onto a target field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingType {
    /// Pass the value through unchanged.
    #[default]
    Direct,
    /// Apply a named pure transform function.
    Transform,
    /// Resolve a foreign key to a target record id.
    Lookup,
    /// Emit a configured constant, ignoring the input.
    Constant,
    /// Evaluate a sandboxed expression over `value` and row fields.
    Expression,
    /// Drop the field.
    Ignore,
}

/// Lifecycle of a field mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldState {
    #[default]
    Pending,
    Mapped,
    Ignored,
    Error,
}

/// Configuration for `Lookup` mappings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    /// Entity type to resolve against.
    pub entity_type: String,

    /// Natural-key field to search by. When unset, a default candidate
    /// list is tried in order (`name`, `code`, `ref`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_field: Option<String>,

    /// Create the target record when no match is found.
    #[serde(default)]
    pub create_if_missing: bool,
}

/// The rule for deriving one target field from zero or one source column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Source column name. Unique within a table mapping.
    pub source_column: String,

    /// Source type string as reported by the connector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<String>,

    /// Whether the source column is nullable.
    #[serde(default = "default_true")]
    pub source_nullable: bool,

    /// Source column is part of the primary key.
    #[serde(default)]
    pub source_is_pk: bool,

    /// Source column references another source table.
    #[serde(default)]
    pub source_is_fk: bool,

    /// Referenced source table for FK columns. Lookups consult the
    /// identity map for this table before falling back to natural keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_fk_table: Option<String>,

    /// Target field name, when mapped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_field: Option<String>,

    /// Mapping behavior.
    #[serde(default)]
    pub mapping_type: MappingType,

    /// Named transform function id for `Transform` mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform_function: Option<String>,

    /// JSON parameters for the transform function (format strings,
    /// prefix/suffix, replace old/new).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub transform_params: serde_json::Value,

    /// Lookup configuration for `Lookup` mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupConfig>,

    /// Constant emitted by `Constant` mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constant_value: Option<Value>,

    /// Expression source for `Expression` mappings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Substituted when the source value is NULL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,

    /// Similarity score that produced this mapping (0 when hand-written).
    #[serde(default)]
    pub confidence: f64,

    /// Mapping lifecycle state.
    #[serde(default)]
    pub state: FieldState,
}

fn default_true() -> bool {
    true
}

impl FieldMapping {
    /// A direct source-to-target mapping.
    pub fn direct(source_column: impl Into<String>, target_field: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            target_field: Some(target_field.into()),
            state: FieldState::Mapped,
            ..Self::unmapped("")
        }
    }

    /// An unmapped column placeholder.
    pub fn unmapped(source_column: impl Into<String>) -> Self {
        Self {
            source_column: source_column.into(),
            source_type: None,
            source_nullable: true,
            source_is_pk: false,
            source_is_fk: false,
            source_fk_table: None,
            target_field: None,
            mapping_type: MappingType::Direct,
            transform_function: None,
            transform_params: serde_json::Value::Null,
            lookup: None,
            constant_value: None,
            expression: None,
            default_value: None,
            confidence: 0.0,
            state: FieldState::Pending,
        }
    }

    /// Whether the loader should evaluate this mapping at all.
    pub fn is_active(&self) -> bool {
        self.state != FieldState::Ignored && self.mapping_type != MappingType::Ignore
    }

    /// String parameter from `transform_params`.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.transform_params.get(key).and_then(|v| v.as_str())
    }

    /// Mark this field ignored.
    pub fn set_ignored(&mut self) {
        self.mapping_type = MappingType::Ignore;
        self.state = FieldState::Ignored;
    }

    /// Reset to an unmapped pending column, keeping source metadata.
    pub fn reset(&mut self) {
        self.target_field = None;
        self.mapping_type = MappingType::Direct;
        self.transform_function = None;
        self.transform_params = serde_json::Value::Null;
        self.lookup = None;
        self.constant_value = None;
        self.expression = None;
        self.confidence = 0.0;
        self.state = FieldState::Pending;
    }
}

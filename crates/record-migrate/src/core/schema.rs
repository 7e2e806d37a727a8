//! Schema metadata for source tables and target entity types.

use serde::{Deserialize, Serialize};

/// A table discovered in the source system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceTable {
    /// Table name.
    pub name: String,

    /// Schema the table lives in.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Row count reported by the source (0 when unknown).
    #[serde(default)]
    pub row_count: i64,
}

fn default_schema() -> String {
    "public".to_string()
}

impl SourceTable {
    /// Fully qualified `schema.table` name.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// A column of a source table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceColumn {
    /// Column name.
    pub name: String,

    /// Source type string as reported by the connector.
    pub data_type: String,

    /// Whether NULLs are allowed.
    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Part of the table's primary key.
    #[serde(default)]
    pub is_primary_key: bool,

    /// References another source table.
    #[serde(default)]
    pub is_foreign_key: bool,

    /// Referenced table when `is_foreign_key` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fk_table: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Kind of a target entity field, including relation metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FieldType {
    Char,
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    DateTime,
    /// Single reference to another entity type.
    Reference { target: String },
    /// Multi-valued reference to another entity type.
    MultiReference { target: String },
}

impl FieldType {
    /// Referenced entity type, when this is a relation field.
    pub fn relation(&self) -> Option<&str> {
        match self {
            FieldType::Reference { target } | FieldType::MultiReference { target } => {
                Some(target.as_str())
            }
            _ => None,
        }
    }
}

/// One field of a target entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityField {
    /// Field name.
    pub name: String,

    /// Field type, with relation metadata for references.
    pub field_type: FieldType,

    /// Whether the target schema requires a value.
    #[serde(default)]
    pub required: bool,
}

/// Schema of one target entity type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySchema {
    /// Entity type identifier (e.g. `res.partner`, `sale.order`).
    pub entity_type: String,

    /// Stored fields of the entity.
    pub fields: Vec<EntityField>,
}

impl EntitySchema {
    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&EntityField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// All reference fields (single and multi valued).
    pub fn reference_fields(&self) -> impl Iterator<Item = &EntityField> {
        self.fields
            .iter()
            .filter(|f| f.field_type.relation().is_some())
    }
}

//! Name-similarity scoring and automatic field mapping generation.
//!
//! Scoring: exact normalized match = 1.0, known synonym = 0.9, substring
//! containment either direction = 0.7, otherwise 0. The best candidate above
//! the configured threshold wins; everything else stays unmapped.

use crate::core::{EntitySchema, FieldType, SourceColumn};

use super::field::{FieldMapping, FieldState, LookupConfig, MappingType};

/// Target fields never auto-mapped (system bookkeeping on the target side).
const SYSTEM_FIELDS: &[&str] = &["id", "create_uid", "create_date", "write_uid", "write_date"];

/// Column-name synonyms seen across legacy schemas, normalized form.
/// Left side is the source column, right side the target field it scores
/// 0.9 against.
const SYNONYMS: &[(&str, &str)] = &[
    ("customerid", "partnerid"),
    ("customername", "name"),
    ("clientname", "name"),
    ("clientid", "partnerid"),
    ("taxid", "vat"),
    ("taxnumber", "vat"),
    ("rfc", "vat"),
    ("phonenumber", "phone"),
    ("telephone", "phone"),
    ("emailaddress", "email"),
    ("mail", "email"),
    ("address", "street"),
    ("addressline1", "street"),
    ("addressline2", "street2"),
    ("zipcode", "zip"),
    ("postalcode", "zip"),
    ("countrycode", "countryid"),
    ("statecode", "stateid"),
    ("isactive", "active"),
    ("enabled", "active"),
    ("createdat", "createdate"),
    ("updatedat", "writedate"),
    ("modifiedat", "writedate"),
];

/// Normalize a column or field name: lowercase, separators stripped.
pub fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' ' | '.'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Similarity between a source column name and a target field name.
pub fn similarity(source: &str, target: &str) -> f64 {
    let source = normalize(source);
    let target = normalize(target);

    if source.is_empty() || target.is_empty() {
        return 0.0;
    }
    if source == target {
        return 1.0;
    }
    if SYNONYMS
        .iter()
        .any(|(from, to)| *from == source && *to == target)
    {
        return 0.9;
    }
    if source.contains(&target) || target.contains(&source) {
        return 0.7;
    }
    0.0
}

/// Best-scoring target field for a source column, with its score.
pub fn best_match<'a>(column: &str, schema: &'a EntitySchema) -> Option<(&'a str, f64)> {
    schema
        .fields
        .iter()
        .filter(|f| !SYSTEM_FIELDS.contains(&f.name.as_str()))
        .map(|f| (f.name.as_str(), similarity(column, &f.name)))
        .filter(|(_, score)| *score > 0.0)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

/// Generate field mappings for every source column against a target schema.
///
/// Columns whose best score clears `threshold` come back `Mapped`; matched
/// reference fields become `Lookup` mappings against the referenced entity
/// type. Everything else is left `Pending` for the operator. Source primary
/// keys are never auto-mapped: they feed the identity map, not a target
/// field, and their short names (`id`) containment-match far too eagerly.
pub fn generate_field_mappings(
    columns: &[SourceColumn],
    schema: &EntitySchema,
    threshold: f64,
) -> Vec<FieldMapping> {
    columns
        .iter()
        .map(|col| {
            let mut fm = FieldMapping::unmapped(&col.name);
            fm.source_type = Some(col.data_type.clone());
            fm.source_nullable = col.nullable;
            fm.source_is_pk = col.is_primary_key;
            fm.source_is_fk = col.is_foreign_key;
            fm.source_fk_table = col.fk_table.clone();

            if col.is_primary_key {
                return fm;
            }

            if let Some((target, score)) = best_match(&col.name, schema) {
                if score >= threshold {
                    fm.target_field = Some(target.to_string());
                    fm.confidence = score;
                    fm.state = FieldState::Mapped;

                    if let Some(FieldType::Reference { target: relation })
                    | Some(FieldType::MultiReference { target: relation }) =
                        schema.field(target).map(|f| &f.field_type)
                    {
                        fm.mapping_type = MappingType::Lookup;
                        fm.lookup = Some(LookupConfig {
                            entity_type: relation.clone(),
                            search_field: None,
                            create_if_missing: false,
                        });
                    }
                }
            }

            fm
        })
        .collect()
}

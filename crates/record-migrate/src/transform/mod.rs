//! Row transformation engine: applies a table's field mappings to source
//! rows, producing target records ready to load.
//!
//! Foreign keys resolve identity-map-first, then by natural key against the
//! target store; per-batch prefetching keeps lookups off the hot path. A
//! failed optional field is skipped with a warning; a failed required field
//! fails the whole row.

pub mod expr;
pub mod functions;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::connect::TargetStore;
use crate::core::{EntitySchema, Record, Value};
use crate::error::{MigrateError, Result};
use crate::identity::IdentityMap;
use crate::mapping::{FieldMapping, LookupConfig, MappingType, TableMapping};

pub use expr::Expression;

/// Natural-key fields tried in order when a lookup names none.
const DEFAULT_SEARCH_FIELDS: &[&str] = &["name", "code", "ref", "external_id"];

/// Result of resolving one foreign-key value.
#[derive(Debug)]
pub enum LookupOutcome {
    /// Resolved to a target record id.
    Found(i64),
    /// No identity mapping and no natural-key match.
    NotFound,
    /// The target store failed while resolving.
    Failed(MigrateError),
}

/// Per-batch caches: bulk identity-map slices per referenced source table,
/// natural-key resolutions, and compiled expressions. Built once per batch
/// so individual rows never trigger per-value identity scans.
#[derive(Default)]
pub struct PrefetchCache {
    fk_maps: HashMap<String, HashMap<String, i64>>,
    resolved: HashMap<(String, String), i64>,
    exprs: HashMap<String, Expression>,
}

impl PrefetchCache {
    fn fk_target(&self, source_table: &str, source_id: &str) -> Option<i64> {
        self.fk_maps
            .get(source_table)
            .and_then(|m| m.get(source_id))
            .copied()
    }
}

/// Applies field mappings to rows. Holds the injected target store and the
/// shared identity map; one instance serves all table workers.
pub struct FieldTransformer {
    target: Arc<dyn TargetStore>,
    identity: Arc<IdentityMap>,
}

impl FieldTransformer {
    pub fn new(target: Arc<dyn TargetStore>, identity: Arc<IdentityMap>) -> Self {
        Self { target, identity }
    }

    /// Build the per-batch cache for a table: identity-map slices for every
    /// referenced source table plus compiled expressions. Expression compile
    /// errors surface here, before any row is touched.
    pub fn prefetch(&self, mapping: &TableMapping) -> Result<PrefetchCache> {
        let mut cache = PrefetchCache::default();

        for fm in mapping.field_mappings.iter().filter(|fm| fm.is_active()) {
            if fm.mapping_type == MappingType::Lookup {
                if let Some(ref fk_table) = fm.source_fk_table {
                    cache
                        .fk_maps
                        .entry(fk_table.clone())
                        .or_insert_with(|| self.identity.mappings_for_table(fk_table));
                }
            }
            if fm.mapping_type == MappingType::Expression {
                let source = fm.expression.as_deref().ok_or_else(|| {
                    MigrateError::Expression(format!(
                        "field {} is an expression mapping without an expression",
                        fm.source_column
                    ))
                })?;
                cache
                    .exprs
                    .insert(fm.source_column.clone(), Expression::compile(source)?);
            }
        }

        Ok(cache)
    }

    /// Transform one source row into a target record.
    ///
    /// Optional fields that fail to transform are dropped with a warning;
    /// a required field that fails or resolves to nothing fails the row.
    pub async fn transform_row(
        &self,
        mapping: &TableMapping,
        schema: &EntitySchema,
        row: &Record,
        cache: &mut PrefetchCache,
    ) -> Result<Record> {
        let mut out = Record::new();

        for fm in mapping.field_mappings.iter().filter(|fm| fm.is_active()) {
            let Some(ref target_field) = fm.target_field else {
                continue;
            };
            let required = schema
                .field(target_field)
                .map(|f| f.required)
                .unwrap_or(false);

            if let Some(value) = self
                .field_value(mapping, fm, target_field, required, row, cache)
                .await?
            {
                out.insert(target_field.clone(), value);
            }
        }

        Ok(out)
    }

    /// Derive one target field. `Ok(None)` means the field is skipped.
    async fn field_value(
        &self,
        mapping: &TableMapping,
        fm: &FieldMapping,
        target_field: &str,
        required: bool,
        row: &Record,
        cache: &mut PrefetchCache,
    ) -> Result<Option<Value>> {
        // Constants ignore the source value entirely.
        if fm.mapping_type == MappingType::Constant {
            return match fm.constant_value.clone() {
                Some(v) => Ok(Some(v)),
                None => Err(MigrateError::validation(
                    target_field,
                    "constant mapping has no constant value",
                )),
            };
        }

        let raw = row.get(&fm.source_column).cloned().unwrap_or(Value::Null);

        if raw.is_null() {
            if let Some(default) = fm.default_value.clone() {
                return Ok(Some(default));
            }
            if required {
                return Err(MigrateError::validation(
                    target_field,
                    format!(
                        "required field is NULL in source column {} with no default",
                        fm.source_column
                    ),
                ));
            }
            return Ok(None);
        }

        match fm.mapping_type {
            MappingType::Direct => Ok(Some(raw)),
            MappingType::Transform => {
                let func = fm.transform_function.as_deref().unwrap_or("");
                match functions::apply(func, raw, &fm.transform_params) {
                    Ok(v) => Ok(Some(v)),
                    Err(e) if required => Err(MigrateError::validation(
                        target_field,
                        format!("required field failed to transform: {e}"),
                    )),
                    Err(e) => {
                        warn!(
                            table = %mapping.source_table,
                            field = %target_field,
                            "Skipping optional field: {e}"
                        );
                        Ok(None)
                    }
                }
            }
            MappingType::Expression => {
                let compiled = cache.exprs.get(&fm.source_column).ok_or_else(|| {
                    MigrateError::Expression(format!(
                        "no compiled expression for column {}",
                        fm.source_column
                    ))
                })?;
                match compiled.eval(&raw, row) {
                    Ok(v) => Ok(Some(v)),
                    Err(e) if required => Err(MigrateError::validation(
                        target_field,
                        format!("required field expression failed: {e}"),
                    )),
                    Err(e) => {
                        warn!(
                            table = %mapping.source_table,
                            field = %target_field,
                            "Skipping optional field: {e}"
                        );
                        Ok(None)
                    }
                }
            }
            MappingType::Lookup => {
                let config = fm.lookup.as_ref().ok_or_else(|| {
                    MigrateError::lookup(
                        target_field,
                        "lookup mapping has no lookup configuration",
                    )
                })?;
                match self.resolve_lookup(fm, config, &raw, cache).await {
                    LookupOutcome::Found(id) => Ok(Some(Value::Int(id))),
                    LookupOutcome::NotFound if required => Err(MigrateError::lookup(
                        target_field,
                        format!(
                            "no {} record found for '{}'",
                            config.entity_type,
                            raw.to_text()
                        ),
                    )),
                    LookupOutcome::NotFound => {
                        warn!(
                            table = %mapping.source_table,
                            field = %target_field,
                            value = %raw,
                            "Skipping unresolved optional reference"
                        );
                        Ok(None)
                    }
                    LookupOutcome::Failed(e) if required => Err(e),
                    LookupOutcome::Failed(e) => {
                        warn!(
                            table = %mapping.source_table,
                            field = %target_field,
                            "Skipping optional reference, lookup failed: {e}"
                        );
                        Ok(None)
                    }
                }
            }
            MappingType::Constant | MappingType::Ignore => Ok(None),
        }
    }

    /// Resolve a foreign-key value to a target id.
    ///
    /// Order: identity map slice for the referenced source table, then a
    /// natural-key search (configured field or the default candidates),
    /// then optional create-if-missing. Store failures are reported, never
    /// swallowed as a miss.
    pub async fn resolve_lookup(
        &self,
        fm: &FieldMapping,
        config: &LookupConfig,
        value: &Value,
        cache: &mut PrefetchCache,
    ) -> LookupOutcome {
        let key = value.to_text();

        if let Some(ref fk_table) = fm.source_fk_table {
            if let Some(id) = cache.fk_target(fk_table, &key) {
                return LookupOutcome::Found(id);
            }
            // Prefetch misses can still be fresh puts from a dependency that
            // finished after this batch's prefetch.
            if let Some(id) = self.identity.get(fk_table, &key) {
                return LookupOutcome::Found(id);
            }
        }

        let cache_key = (config.entity_type.clone(), key.clone());
        if let Some(&id) = cache.resolved.get(&cache_key) {
            return LookupOutcome::Found(id);
        }

        let candidates: Vec<&str> = match config.search_field.as_deref() {
            Some(field) => vec![field],
            None => DEFAULT_SEARCH_FIELDS.to_vec(),
        };

        for field in &candidates {
            match self.target.search(&config.entity_type, field, value).await {
                Ok(ids) => {
                    if let Some(&id) = ids.first() {
                        if ids.len() > 1 {
                            warn!(
                                entity = %config.entity_type,
                                field = %field,
                                value = %value,
                                matches = ids.len(),
                                "Ambiguous lookup, using first match"
                            );
                        }
                        cache.resolved.insert(cache_key, id);
                        return LookupOutcome::Found(id);
                    }
                }
                Err(e) => return LookupOutcome::Failed(e),
            }
        }

        if config.create_if_missing {
            let name_field = config
                .search_field
                .as_deref()
                .unwrap_or(DEFAULT_SEARCH_FIELDS[0]);
            let mut fields = Record::new();
            fields.insert(name_field.to_string(), value.clone());
            match self.target.create(&config.entity_type, fields).await {
                Ok(id) => {
                    cache.resolved.insert(cache_key, id);
                    return LookupOutcome::Found(id);
                }
                Err(e) => return LookupOutcome::Failed(e),
            }
        }

        LookupOutcome::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EntityField, FieldType, SourceColumn, SourceTable};
    use crate::mapping::FieldState;
    use std::sync::Mutex;

    /// In-memory target store with searchable named records.
    struct FakeTarget {
        records: Mutex<Vec<(String, i64, Record)>>,
        next_id: Mutex<i64>,
        fail_search: bool,
    }

    impl FakeTarget {
        fn new() -> Self {
            Self {
                records: Mutex::new(Vec::new()),
                next_id: Mutex::new(1),
                fail_search: false,
            }
        }

        fn seed(&self, entity: &str, fields: Record) -> i64 {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next += 1;
            self.records
                .lock()
                .unwrap()
                .push((entity.to_string(), id, fields));
            id
        }
    }

    #[async_trait::async_trait]
    impl TargetStore for FakeTarget {
        async fn describe_schema(&self, entity_type: &str) -> Result<EntitySchema> {
            Ok(EntitySchema {
                entity_type: entity_type.to_string(),
                fields: Vec::new(),
            })
        }

        async fn search(&self, entity_type: &str, field: &str, value: &Value) -> Result<Vec<i64>> {
            if self.fail_search {
                return Err(MigrateError::Target("connection lost".into()));
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _, f)| {
                    e == entity_type && f.get(field).map(|v| v == value).unwrap_or(false)
                })
                .map(|(_, id, _)| *id)
                .collect())
        }

        async fn create(&self, entity_type: &str, fields: Record) -> Result<i64> {
            Ok(self.seed(entity_type, fields))
        }

        async fn update(&self, _entity_type: &str, _id: i64, _fields: Record) -> Result<()> {
            Ok(())
        }

        async fn count(&self, entity_type: &str) -> Result<i64> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _, _)| e == entity_type)
                .count() as i64)
        }
    }

    fn schema() -> EntitySchema {
        EntitySchema {
            entity_type: "sale.order".into(),
            fields: vec![
                EntityField {
                    name: "name".into(),
                    field_type: FieldType::Char,
                    required: true,
                },
                EntityField {
                    name: "partner_id".into(),
                    field_type: FieldType::Reference {
                        target: "res.partner".into(),
                    },
                    required: true,
                },
                EntityField {
                    name: "note".into(),
                    field_type: FieldType::Text,
                    required: false,
                },
            ],
        }
    }

    fn table_mapping(field_mappings: Vec<FieldMapping>) -> TableMapping {
        let mut tm = TableMapping::discovered(
            &SourceTable {
                name: "orders".into(),
                schema: "dbo".into(),
                row_count: 1,
            },
            Vec::<SourceColumn>::new(),
        );
        tm.target_entity_type = Some("sale.order".into());
        tm.field_mappings = field_mappings;
        tm
    }

    fn lookup_mapping(create_if_missing: bool) -> FieldMapping {
        FieldMapping {
            source_is_fk: true,
            source_fk_table: Some("customers".into()),
            mapping_type: MappingType::Lookup,
            lookup: Some(LookupConfig {
                entity_type: "res.partner".into(),
                search_field: None,
                create_if_missing,
            }),
            state: FieldState::Mapped,
            ..FieldMapping::direct("customer_id", "partner_id")
        }
    }

    fn row(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_direct_transform_constant_row() {
        let target = Arc::new(FakeTarget::new());
        let identity = Arc::new(IdentityMap::new("proj"));
        let engine = FieldTransformer::new(target, identity);

        let mut upper = FieldMapping::direct("order_no", "name");
        upper.mapping_type = MappingType::Transform;
        upper.transform_function = Some("uppercase".into());

        let mut constant = FieldMapping::direct("ignored", "note");
        constant.mapping_type = MappingType::Constant;
        constant.constant_value = Some(Value::Text("migrated".into()));

        let tm = table_mapping(vec![upper, constant]);
        let mut cache = engine.prefetch(&tm).unwrap();

        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("order_no", Value::Text("so-1".into()))]),
                &mut cache,
            )
            .await
            .unwrap();

        assert_eq!(out.get("name"), Some(&Value::Text("SO-1".into())));
        assert_eq!(out.get("note"), Some(&Value::Text("migrated".into())));
    }

    #[tokio::test]
    async fn test_lookup_prefers_identity_map() {
        let target = Arc::new(FakeTarget::new());
        // A natural-key match exists, but the identity map must win.
        target.seed("res.partner", row(&[("name", Value::Text("7".into()))]));

        let identity = Arc::new(IdentityMap::new("proj"));
        identity.put("customers", "7", "res.partner", 700);

        let engine = FieldTransformer::new(target, identity);
        let tm = table_mapping(vec![lookup_mapping(false)]);
        let mut cache = engine.prefetch(&tm).unwrap();

        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("customer_id", Value::Int(7))]),
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(out.get("partner_id"), Some(&Value::Int(700)));
    }

    #[tokio::test]
    async fn test_lookup_natural_key_then_create() {
        let target = Arc::new(FakeTarget::new());
        let seeded = target.seed("res.partner", row(&[("name", Value::Text("Acme".into()))]));

        let identity = Arc::new(IdentityMap::new("proj"));
        let engine = FieldTransformer::new(target.clone(), identity);

        let mut fm = lookup_mapping(true);
        fm.source_fk_table = None;
        fm.source_is_fk = false;
        let tm = table_mapping(vec![fm]);
        let mut cache = engine.prefetch(&tm).unwrap();

        // Natural-key hit.
        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("customer_id", Value::Text("Acme".into()))]),
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(out.get("partner_id"), Some(&Value::Int(seeded)));

        // Miss creates, and the second resolution reuses the cached id.
        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("customer_id", Value::Text("Globex".into()))]),
                &mut cache,
            )
            .await
            .unwrap();
        let created = match out.get("partner_id") {
            Some(Value::Int(id)) => *id,
            other => panic!("expected id, got {other:?}"),
        };
        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("customer_id", Value::Text("Globex".into()))]),
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(out.get("partner_id"), Some(&Value::Int(created)));
        assert_eq!(target.count("res.partner").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_required_lookup_miss_fails_row() {
        let target = Arc::new(FakeTarget::new());
        let identity = Arc::new(IdentityMap::new("proj"));
        let engine = FieldTransformer::new(target, identity);

        let tm = table_mapping(vec![lookup_mapping(false)]);
        let mut cache = engine.prefetch(&tm).unwrap();

        let err = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("customer_id", Value::Int(99))]),
                &mut cache,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Lookup);
    }

    #[tokio::test]
    async fn test_store_failure_fails_required_field() {
        let mut target = FakeTarget::new();
        target.fail_search = true;
        let engine = FieldTransformer::new(Arc::new(target), Arc::new(IdentityMap::new("proj")));

        let mut fm = lookup_mapping(false);
        fm.source_fk_table = None;
        let tm = table_mapping(vec![fm]);
        let mut cache = engine.prefetch(&tm).unwrap();

        assert!(engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("customer_id", Value::Int(1))]),
                &mut cache,
            )
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_store_failure_skips_optional_field() {
        let mut target = FakeTarget::new();
        target.fail_search = true;
        let engine = FieldTransformer::new(Arc::new(target), Arc::new(IdentityMap::new("proj")));

        // The same failure against an optional field downgrades to a skip,
        // like any other field-level lookup problem.
        let mut fm = lookup_mapping(false);
        fm.source_fk_table = None;
        fm.target_field = Some("note".into());
        let tm = table_mapping(vec![fm]);
        let mut cache = engine.prefetch(&tm).unwrap();

        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("customer_id", Value::Int(1))]),
                &mut cache,
            )
            .await
            .unwrap();
        assert!(!out.contains_key("note"));
    }

    #[tokio::test]
    async fn test_null_handling_and_escalation() {
        let target = Arc::new(FakeTarget::new());
        let engine = FieldTransformer::new(target, Arc::new(IdentityMap::new("proj")));

        // Optional null with a default gets the default.
        let mut with_default = FieldMapping::direct("comment", "note");
        with_default.default_value = Some(Value::Text("n/a".into()));
        let tm = table_mapping(vec![with_default]);
        let mut cache = engine.prefetch(&tm).unwrap();
        let out = engine
            .transform_row(&tm, &schema(), &Record::new(), &mut cache)
            .await
            .unwrap();
        assert_eq!(out.get("note"), Some(&Value::Text("n/a".into())));

        // Required null with no default fails the row.
        let tm = table_mapping(vec![FieldMapping::direct("order_no", "name")]);
        let mut cache = engine.prefetch(&tm).unwrap();
        let err = engine
            .transform_row(&tm, &schema(), &Record::new(), &mut cache)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_optional_transform_failure_skips_field() {
        let target = Arc::new(FakeTarget::new());
        let engine = FieldTransformer::new(target, Arc::new(IdentityMap::new("proj")));

        let mut fm = FieldMapping::direct("comment", "note");
        fm.mapping_type = MappingType::Transform;
        fm.transform_function = Some("to_date".into());
        let tm = table_mapping(vec![fm]);
        let mut cache = engine.prefetch(&tm).unwrap();

        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("comment", Value::Text("not a date".into()))]),
                &mut cache,
            )
            .await
            .unwrap();
        assert!(!out.contains_key("note"));
    }

    #[tokio::test]
    async fn test_expression_field() {
        let target = Arc::new(FakeTarget::new());
        let engine = FieldTransformer::new(target, Arc::new(IdentityMap::new("proj")));

        let mut fm = FieldMapping::direct("order_no", "name");
        fm.mapping_type = MappingType::Expression;
        fm.expression = Some("'SO-' + upper(value)".into());
        let tm = table_mapping(vec![fm]);
        let mut cache = engine.prefetch(&tm).unwrap();

        let out = engine
            .transform_row(
                &tm,
                &schema(),
                &row(&[("order_no", Value::Text("a1".into()))]),
                &mut cache,
            )
            .await
            .unwrap();
        assert_eq!(out.get("name"), Some(&Value::Text("SO-A1".into())));
    }
}

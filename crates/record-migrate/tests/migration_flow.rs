//! End-to-end migration flow against in-memory source and target fakes:
//! discovery, suggestion, dependency-ordered execution, foreign-key
//! resolution, error isolation, and idempotent re-runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use record_migrate::{
    Config, Cursor, EntityField, EntitySchema, FieldMapping, FieldType, IdentityMap,
    MigrateError, Quarantine, Record, Registry, Result, RowPage, RunStatus, SourceColumn,
    SourceConnector, SourceTable, TargetStore, Value,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

// ===== Fakes =====

#[derive(Default)]
struct MemSource {
    tables: Vec<(SourceTable, Vec<SourceColumn>, Vec<Record>)>,
}

impl MemSource {
    fn add_table(&mut self, name: &str, columns: Vec<SourceColumn>, rows: Vec<Record>) {
        self.tables.push((
            SourceTable {
                name: name.into(),
                schema: "dbo".into(),
                row_count: rows.len() as i64,
            },
            columns,
            rows,
        ));
    }
}

#[async_trait]
impl SourceConnector for MemSource {
    async fn list_tables(&self) -> Result<Vec<SourceTable>> {
        Ok(self.tables.iter().map(|(t, _, _)| t.clone()).collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<SourceColumn>> {
        self.tables
            .iter()
            .find(|(t, _, _)| t.name == table)
            .map(|(_, c, _)| c.clone())
            .ok_or_else(|| MigrateError::Source(format!("no table {table}")))
    }

    async fn fetch_rows(
        &self,
        table: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<RowPage> {
        let rows = self
            .tables
            .iter()
            .find(|(t, _, _)| t.name == table)
            .map(|(_, _, r)| r.clone())
            .ok_or_else(|| MigrateError::Source(format!("no table {table}")))?;
        let start: usize = cursor.map(|c| c.0.parse().unwrap_or(0)).unwrap_or(0);
        let end = (start + limit).min(rows.len());
        let next = if end < rows.len() {
            Some(Cursor(end.to_string()))
        } else {
            None
        };
        Ok(RowPage {
            rows: rows[start..end].to_vec(),
            next,
        })
    }
}

#[derive(Default)]
struct MemTarget {
    schemas: HashMap<String, EntitySchema>,
    records: Mutex<Vec<(String, i64, Record)>>,
    next_id: Mutex<i64>,
    creates: Mutex<u64>,
    updates: Mutex<u64>,
}

impl MemTarget {
    fn with_schema(mut self, schema: EntitySchema) -> Self {
        self.schemas.insert(schema.entity_type.clone(), schema);
        self
    }

    fn ids_for(&self, entity: &str) -> Vec<i64> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| e == entity)
            .map(|(_, id, _)| *id)
            .collect()
    }

    fn records_for(&self, entity: &str) -> Vec<Record> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _, _)| e == entity)
            .map(|(_, _, f)| f.clone())
            .collect()
    }
}

#[async_trait]
impl TargetStore for MemTarget {
    async fn describe_schema(&self, entity_type: &str) -> Result<EntitySchema> {
        self.schemas
            .get(entity_type)
            .cloned()
            .ok_or_else(|| MigrateError::Schema {
                subject: entity_type.to_string(),
                message: "unknown entity type".to_string(),
            })
    }

    async fn search(&self, entity_type: &str, field: &str, value: &Value) -> Result<Vec<i64>> {
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
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = *next;
        self.records
            .lock()
            .unwrap()
            .push((entity_type.to_string(), id, fields));
        *self.creates.lock().unwrap() += 1;
        Ok(id)
    }

    async fn update(&self, entity_type: &str, id: i64, fields: Record) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        for (e, rid, f) in records.iter_mut() {
            if e == entity_type && *rid == id {
                *f = fields;
                *self.updates.lock().unwrap() += 1;
                return Ok(());
            }
        }
        Err(MigrateError::Target(format!("no record {id}")))
    }

    async fn count(&self, entity_type: &str) -> Result<i64> {
        Ok(self.ids_for(entity_type).len() as i64)
    }
}

// ===== Fixture: a small legacy sales schema =====

fn field(name: &str, field_type: FieldType, required: bool) -> EntityField {
    EntityField {
        name: name.into(),
        field_type,
        required,
    }
}

fn sales_target() -> MemTarget {
    MemTarget::default()
        .with_schema(EntitySchema {
            entity_type: "res.partner".into(),
            fields: vec![
                field("name", FieldType::Char, true),
                field("email", FieldType::Char, false),
            ],
        })
        .with_schema(EntitySchema {
            entity_type: "product.product".into(),
            fields: vec![
                field("name", FieldType::Char, true),
                field("code", FieldType::Char, false),
            ],
        })
        .with_schema(EntitySchema {
            entity_type: "sale.order".into(),
            fields: vec![
                field("name", FieldType::Char, true),
                field(
                    "partner_id",
                    FieldType::Reference {
                        target: "res.partner".into(),
                    },
                    true,
                ),
            ],
        })
        .with_schema(EntitySchema {
            entity_type: "sale.order.line".into(),
            fields: vec![
                field(
                    "order_id",
                    FieldType::Reference {
                        target: "sale.order".into(),
                    },
                    true,
                ),
                field(
                    "product_id",
                    FieldType::Reference {
                        target: "product.product".into(),
                    },
                    true,
                ),
                field("quantity", FieldType::Float, false),
            ],
        })
}

fn pk() -> SourceColumn {
    SourceColumn {
        name: "id".into(),
        data_type: "int".into(),
        nullable: false,
        is_primary_key: true,
        is_foreign_key: false,
        fk_table: None,
    }
}

fn col(name: &str) -> SourceColumn {
    SourceColumn {
        name: name.into(),
        data_type: "varchar".into(),
        nullable: true,
        is_primary_key: false,
        is_foreign_key: false,
        fk_table: None,
    }
}

fn fk(name: &str, table: &str) -> SourceColumn {
    SourceColumn {
        name: name.into(),
        data_type: "int".into(),
        nullable: true,
        is_primary_key: false,
        is_foreign_key: true,
        fk_table: Some(table.into()),
    }
}

fn row(pairs: &[(&str, Value)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn sales_source() -> MemSource {
    let mut source = MemSource::default();
    source.add_table(
        "customers",
        vec![pk(), col("customer_name"), col("email_address")],
        vec![
            row(&[
                ("id", Value::Int(1)),
                ("customer_name", Value::Text("Acme".into())),
                ("email_address", Value::Text("info@acme.test".into())),
            ]),
            row(&[
                ("id", Value::Int(2)),
                ("customer_name", Value::Text("Globex".into())),
                ("email_address", Value::Null),
            ]),
        ],
    );
    source.add_table(
        "products",
        vec![pk(), col("name"), col("code")],
        vec![
            row(&[
                ("id", Value::Int(1)),
                ("name", Value::Text("Widget".into())),
                ("code", Value::Text("W-1".into())),
            ]),
            row(&[
                ("id", Value::Int(2)),
                ("name", Value::Text("Gadget".into())),
                ("code", Value::Text("G-1".into())),
            ]),
        ],
    );
    source.add_table(
        "orders",
        vec![pk(), col("order_no"), fk("customer_id", "customers")],
        vec![
            row(&[
                ("id", Value::Int(10)),
                ("order_no", Value::Text("SO-10".into())),
                ("customer_id", Value::Int(1)),
            ]),
            row(&[
                ("id", Value::Int(11)),
                ("order_no", Value::Text("SO-11".into())),
                ("customer_id", Value::Int(2)),
            ]),
        ],
    );
    source.add_table(
        "order_lines",
        vec![
            pk(),
            fk("order_id", "orders"),
            fk("product_id", "products"),
            col("quantity"),
        ],
        vec![
            row(&[
                ("id", Value::Int(100)),
                ("order_id", Value::Int(10)),
                ("product_id", Value::Int(1)),
                ("quantity", Value::Float(1.0)),
            ]),
            row(&[
                ("id", Value::Int(101)),
                ("order_id", Value::Int(10)),
                ("product_id", Value::Int(2)),
                ("quantity", Value::Float(2.0)),
            ]),
            row(&[
                ("id", Value::Int(102)),
                ("order_id", Value::Int(11)),
                ("product_id", Value::Int(2)),
                ("quantity", Value::Float(3.0)),
            ]),
        ],
    );
    source
}

fn config() -> Config {
    Config::from_yaml(
        "
project: legacy-sales
migration:
  workers: 2
  batch_size: 25
  retry_delay_ms: 1
",
    )
    .expect("valid config")
}

async fn mapped_registry(
    source: MemSource,
    target: Arc<MemTarget>,
    identity: Arc<IdentityMap>,
) -> Registry {
    let quarantine = Arc::new(Quarantine::new("legacy-sales", 3));
    let mut registry = Registry::new(config(), Arc::new(source), target, identity, quarantine);

    registry.discover().await.expect("discovery");
    for table in ["customers", "products", "orders", "order_lines"] {
        registry.accept_suggestion(table).await.expect(table);
    }

    // The auto-suggester cannot know the order number is the order's name.
    let orders = registry.project_mut().table_mut("orders").unwrap();
    orders
        .field_mappings
        .retain(|fm| fm.source_column != "order_no");
    orders
        .field_mappings
        .push(FieldMapping::direct("order_no", "name"));

    registry
}

// ===== Tests =====

#[tokio::test]
async fn full_sales_migration_resolves_every_reference() {
    init_tracing();
    let target = Arc::new(sales_target());
    let identity = Arc::new(IdentityMap::new("legacy-sales"));
    let mut registry = mapped_registry(sales_source(), target.clone(), identity.clone()).await;

    // Referenced tables must be planned before their dependents.
    let order = registry.migration_order().await.unwrap();
    assert!(!order.has_cycle);
    let pos = |t: &str| order.tables.iter().position(|x| x == t).unwrap();
    assert!(pos("customers") < pos("orders"));
    assert!(pos("orders") < pos("order_lines"));
    assert!(pos("products") < pos("order_lines"));

    assert!(registry.validate().await.unwrap().is_empty());

    let report = registry.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    let totals = report.totals();
    assert_eq!(totals.success, 9);
    assert_eq!(totals.created, 9);
    assert_eq!(totals.errors, 0);
    assert_eq!(identity.len(), 9);

    // Every order points at a migrated partner, every line at a migrated
    // order and product.
    let partner_ids = target.ids_for("res.partner");
    for order in target.records_for("sale.order") {
        match order.get("partner_id") {
            Some(Value::Int(id)) => assert!(partner_ids.contains(id)),
            other => panic!("unresolved partner_id: {other:?}"),
        }
    }
    let order_ids = target.ids_for("sale.order");
    let product_ids = target.ids_for("product.product");
    let lines = target.records_for("sale.order.line");
    assert_eq!(lines.len(), 3);
    for line in lines {
        match line.get("order_id") {
            Some(Value::Int(id)) => assert!(order_ids.contains(id)),
            other => panic!("unresolved order_id: {other:?}"),
        }
        match line.get("product_id") {
            Some(Value::Int(id)) => assert!(product_ids.contains(id)),
            other => panic!("unresolved product_id: {other:?}"),
        }
    }
}

#[tokio::test]
async fn replay_updates_in_place_instead_of_duplicating() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let identity_path = dir.path().join("identity.json");

    let target = Arc::new(sales_target());
    let identity = Arc::new(IdentityMap::new("legacy-sales").with_path(&identity_path));
    let mut registry = mapped_registry(sales_source(), target.clone(), identity).await;
    registry.run().await.unwrap();
    assert_eq!(*target.creates.lock().unwrap(), 9);

    // A fresh engine instance with the persisted identity map replays the
    // same source without creating duplicates.
    let identity = Arc::new(IdentityMap::load(&identity_path, "legacy-sales").unwrap());
    assert_eq!(identity.len(), 9);
    let mut registry = mapped_registry(sales_source(), target.clone(), identity).await;
    let report = registry.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let totals = report.totals();
    assert_eq!(totals.updated, 9);
    assert_eq!(totals.created, 0);
    assert_eq!(*target.creates.lock().unwrap(), 9);
    assert_eq!(target.count("res.partner").await.unwrap(), 2);
    assert_eq!(target.count("sale.order.line").await.unwrap(), 3);
}

#[tokio::test]
async fn one_bad_row_in_a_hundred_is_quarantined_not_fatal() {
    init_tracing();
    let mut source = MemSource::default();
    let rows: Vec<Record> = (0..100)
        .map(|i| {
            let name = if i == 42 {
                Value::Null
            } else {
                Value::Text(format!("Customer {i}"))
            };
            row(&[("id", Value::Int(i)), ("customer_name", name)])
        })
        .collect();
    source.add_table("customers", vec![pk(), col("customer_name")], rows);

    let target = Arc::new(sales_target());
    let identity = Arc::new(IdentityMap::new("legacy-sales"));
    let quarantine = Arc::new(Quarantine::new("legacy-sales", 3));
    let mut registry = Registry::new(
        config(),
        Arc::new(source),
        target.clone(),
        identity,
        quarantine.clone(),
    );
    registry.discover().await.unwrap();
    registry.accept_suggestion("customers").await.unwrap();

    let report = registry.run().await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    let totals = report.totals();
    assert_eq!(totals.success, 99);
    assert_eq!(totals.errors, 1);
    assert_eq!(target.count("res.partner").await.unwrap(), 99);

    // Counters reconcile with the quarantine.
    let tm = registry.project().table("customers").unwrap();
    assert_eq!(tm.migrated_records + tm.error_records, 100);
    let pending = quarantine.pending_for_table("customers");
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source_id, "42");

    // The snapshot still has the NULL name, so a manual retry fails again.
    let id = pending[0].id;
    assert!(!registry.retry_error(id).await.unwrap());
    assert_eq!(quarantine.get(id).unwrap().retry_count, 1);

    // Writing the row off clears the retry pool.
    registry.ignore_error(id).unwrap();
    assert_eq!(quarantine.pending_count(), 0);
}

#[tokio::test]
async fn missing_required_dependency_blocks_the_run() {
    init_tracing();
    let mut source = MemSource::default();
    source.add_table(
        "orders",
        vec![pk(), col("order_no"), fk("customer_id", "customers")],
        vec![row(&[
            ("id", Value::Int(10)),
            ("order_no", Value::Text("SO-10".into())),
            ("customer_id", Value::Int(1)),
        ])],
    );

    let target = Arc::new(sales_target());
    let identity = Arc::new(IdentityMap::new("legacy-sales"));
    let quarantine = Arc::new(Quarantine::new("legacy-sales", 3));
    let mut registry = Registry::new(
        config(),
        Arc::new(source),
        target,
        identity,
        quarantine,
    );
    registry.discover().await.unwrap();
    registry.accept_suggestion("orders").await.unwrap();

    // sale.order requires a partner, but nothing maps to res.partner and
    // the target holds none.
    let issues = registry.validate().await.unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].entity_type, "res.partner");
    assert!(registry.run().await.is_err());
}

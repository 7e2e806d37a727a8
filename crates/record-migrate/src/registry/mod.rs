//! Migration registry and orchestrator: discovers source tables, tracks
//! their mappings and topics, and runs migrations in dependency order with
//! layer-level parallelism.
//!
//! Tables inside one dependency layer migrate concurrently, bounded by the
//! worker pool; layers join before the next starts, so a table never runs
//! before everything it references. A table that fails hard-blocks all of
//! its transitive dependents for the rest of the run.

pub mod catalog;
pub mod project;

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::connect::{SourceConnector, TargetStore};
use crate::core::EntitySchema;
use crate::error::{MigrateError, Result};
use crate::identity::IdentityMap;
use crate::loader::{BatchLoader, BatchOutcome, Control};
use crate::mapping::{MigrationState, TableMapping};
use crate::quarantine::Quarantine;
use crate::resolver::{self, DependencyIssue, DependencyResolver, MigrationOrder};

pub use catalog::{EntityCatalog, EntitySuggestion};
pub use project::{Project, TopicProgress};

/// Terminal status of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithErrors,
    Cancelled,
}

/// Per-table section of a run report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableReport {
    pub table: String,
    pub entity_type: String,
    pub outcome: BatchOutcome,
    pub state: MigrationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Summary of one migration run, serializable for operators and audits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub project: String,
    pub status: RunStatus,
    pub has_cycle: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableReport>,
}

impl MigrationReport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Totals across all tables.
    pub fn totals(&self) -> BatchOutcome {
        let mut totals = BatchOutcome::default();
        for t in &self.tables {
            totals.merge(t.outcome);
        }
        totals
    }
}

/// Cloneable handle for pausing, resuming and cancelling a running
/// migration from another task. Takes effect at batch boundaries.
#[derive(Clone)]
pub struct Controller {
    tx: Arc<watch::Sender<Control>>,
}

impl Controller {
    pub fn pause(&self) {
        let _ = self.tx.send(Control::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(Control::Run);
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(Control::Cancel);
    }
}

/// The central coordination point of one migration project.
pub struct Registry {
    config: Config,
    project: Project,
    project_path: Option<PathBuf>,
    catalog: EntityCatalog,
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetStore>,
    identity: Arc<IdentityMap>,
    quarantine: Arc<Quarantine>,
    control: Arc<watch::Sender<Control>>,
}

impl Registry {
    pub fn new(
        config: Config,
        source: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetStore>,
        identity: Arc<IdentityMap>,
        quarantine: Arc<Quarantine>,
    ) -> Self {
        let project = Project::new(&config.project, config.hash());
        let (tx, _rx) = watch::channel(Control::Run);
        Self {
            config,
            project,
            project_path: None,
            catalog: EntityCatalog::default(),
            source,
            target,
            identity,
            quarantine,
            control: Arc::new(tx),
        }
    }

    /// Resume from previously persisted project state.
    pub fn with_project(mut self, mut project: Project) -> Result<Self> {
        project.check_config(&self.config)?;
        self.project = project;
        Ok(self)
    }

    /// File the project state persists to after every table.
    pub fn with_project_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.project_path = Some(path.into());
        self
    }

    pub fn with_catalog(mut self, catalog: EntityCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    pub fn project_mut(&mut self) -> &mut Project {
        &mut self.project
    }

    /// Handle for pause/resume/cancel from other tasks.
    pub fn controller(&self) -> Controller {
        Controller {
            tx: self.control.clone(),
        }
    }

    /// Discover source tables: new tables get a mapping with a catalog
    /// suggestion, known tables only refresh their row counts. Returns the
    /// number of newly discovered tables.
    pub async fn discover(&mut self) -> Result<usize> {
        let threshold = self.config.migration.get_suggestion_threshold();
        let tables = self.source.list_tables().await?;
        let mut discovered = 0;

        for table in tables {
            if !self.config.migration.includes_table(&table.name) {
                continue;
            }
            if let Some(existing) = self.project.table_mut(&table.name) {
                existing.row_count = table.row_count;
                continue;
            }

            let columns = self.source.describe_table(&table.name).await?;
            let mut tm = TableMapping::discovered(&table, columns);
            if let Some(s) = self.catalog.suggest(&table.name, threshold) {
                info!(
                    table = %table.name,
                    entity = %s.entity_type,
                    confidence = s.confidence,
                    "Suggesting entity type"
                );
                tm.suggest(s.entity_type, Some(s.topic), s.confidence);
            }
            self.project.upsert_table(tm);
            discovered += 1;
        }

        info!(
            project = %self.project.name,
            discovered,
            total = self.project.tables.len(),
            "Discovery done"
        );
        self.save_project()?;
        Ok(discovered)
    }

    /// Accept a table's pending suggestion, generating field mappings from
    /// the target schema.
    pub async fn accept_suggestion(&mut self, table: &str) -> Result<()> {
        let entity_type = self
            .project
            .table(table)
            .and_then(|tm| tm.suggested_entity_type.clone())
            .ok_or_else(|| {
                MigrateError::Config(format!("table {table} has no pending suggestion"))
            })?;
        let schema = self.target.describe_schema(&entity_type).await?;
        let threshold = self.config.migration.get_suggestion_threshold();
        let tm = self
            .project
            .table_mut(table)
            .ok_or_else(|| MigrateError::Config(format!("unknown table {table}")))?;
        tm.accept_suggestion(&schema, threshold)?;
        self.save_project()
    }

    /// Bind a table to an entity type directly, overriding any suggestion.
    pub async fn bind_table(&mut self, table: &str, entity_type: &str) -> Result<()> {
        let schema = self.target.describe_schema(entity_type).await?;
        let threshold = self.config.migration.get_suggestion_threshold();
        let tm = self
            .project
            .table_mut(table)
            .ok_or_else(|| MigrateError::Config(format!("unknown table {table}")))?;
        tm.bind(entity_type, &schema, threshold);
        self.save_project()
    }

    /// Exclude a table from migration.
    pub fn ignore_table(&mut self, table: &str) -> Result<()> {
        let tm = self
            .project
            .table_mut(table)
            .ok_or_else(|| MigrateError::Config(format!("unknown table {table}")))?;
        tm.set_ignored();
        self.save_project()
    }

    /// Planned execution order over the currently mapped tables.
    pub async fn migration_order(&self) -> Result<MigrationOrder> {
        let schemas = self.entity_schemas().await?;
        let runnable = self.runnable_snapshot();
        Ok(DependencyResolver::build(&runnable, &schemas).order())
    }

    /// Pre-run check: required references that neither a mapped table nor
    /// existing target data can satisfy.
    pub async fn validate(&self) -> Result<Vec<DependencyIssue>> {
        let schemas = self.entity_schemas().await?;
        let runnable = self.runnable_snapshot();
        self.validate_with(&runnable, &schemas).await
    }

    /// Run the migration: validate, order into layers, and execute each
    /// layer with bounded parallelism. Completed tables are skipped, so a
    /// second run resumes where the first stopped.
    pub async fn run(&mut self) -> Result<MigrationReport> {
        // Clear any stale pause/cancel from a previous run.
        let _ = self.control.send(Control::Run);

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        // A schema failure is fatal for the tables mapped to that entity
        // type (and their dependents), not for the whole run.
        let (schemas, schema_failures) = self.entity_schemas_lenient().await;
        let runnable = self.runnable_snapshot();
        if runnable.is_empty() {
            return Err(MigrateError::Config(
                "no mapped tables to migrate".into(),
            ));
        }

        let issues = self.validate_with(&runnable, &schemas).await?;
        if !issues.is_empty() {
            let detail: Vec<String> = issues
                .iter()
                .map(|i| format!("{}: {}", i.table, i.message))
                .collect();
            return Err(MigrateError::Config(format!(
                "unresolvable dependencies: {}",
                detail.join("; ")
            )));
        }

        let resolver = DependencyResolver::build(&runnable, &schemas);
        let order = resolver.order();
        if order.has_cycle {
            warn!(
                run_id = %run_id,
                "Dependency cycle present, cycle members run last"
            );
        }
        let layers = resolver.layers();

        info!(
            run_id = %run_id,
            project = %self.project.name,
            tables = order.tables.len(),
            layers = layers.len(),
            workers = self.config.migration.get_workers(),
            "Starting migration run"
        );

        let loader = Arc::new(BatchLoader::new(
            self.source.clone(),
            self.target.clone(),
            self.identity.clone(),
            self.quarantine.clone(),
            self.config.migration.clone(),
        ));
        let semaphore = Arc::new(Semaphore::new(self.config.migration.get_workers()));

        let mut reports: Vec<TableReport> = Vec::new();
        let mut blocked: BTreeSet<String> = BTreeSet::new();
        let mut cancelled = false;

        'layers: for layer in layers {
            let mut handles = Vec::new();
            for table_name in layer {
                let Some(tm) = self.project.table(&table_name) else {
                    continue;
                };
                let entity_type = tm.target_entity_type.clone().unwrap_or_default();

                if tm.migration_state == MigrationState::Completed {
                    info!(table = %table_name, "Skipping completed table");
                    reports.push(TableReport {
                        table: table_name,
                        entity_type,
                        outcome: BatchOutcome::default(),
                        state: MigrationState::Completed,
                        error: None,
                        duration_ms: 0,
                    });
                    continue;
                }

                if blocked.contains(&table_name) {
                    let message = "blocked by a failed dependency".to_string();
                    warn!(table = %table_name, "{message}");
                    if let Some(tm) = self.project.table_mut(&table_name) {
                        tm.mark_error(&message);
                    }
                    reports.push(TableReport {
                        table: table_name,
                        entity_type,
                        outcome: BatchOutcome::default(),
                        state: MigrationState::Error,
                        error: Some(message),
                        duration_ms: 0,
                    });
                    continue;
                }

                let Some(schema) = schemas.get(&entity_type).cloned() else {
                    let message = schema_failures
                        .get(&entity_type)
                        .cloned()
                        .unwrap_or_else(|| {
                            format!("no schema for entity type {entity_type}")
                        });
                    warn!(table = %table_name, "Cannot migrate: {message}");
                    if let Some(tm) = self.project.table_mut(&table_name) {
                        tm.mark_error(&message);
                    }
                    for dependent in resolver.dependents_of(&table_name) {
                        blocked.insert(dependent);
                    }
                    reports.push(TableReport {
                        table: table_name,
                        entity_type,
                        outcome: BatchOutcome::default(),
                        state: MigrationState::Error,
                        error: Some(message),
                        duration_ms: 0,
                    });
                    continue;
                };
                let mut tm = tm.clone();
                let loader = loader.clone();
                let semaphore = semaphore.clone();
                let mut rx = self.control.subscribe();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let start = Instant::now();
                    tm.mark_running();
                    let result = loader.migrate_table(&mut tm, &schema, &mut rx).await;
                    (tm, result, start.elapsed().as_millis() as u64)
                }));
            }

            // Layer barrier: every table joins before the next layer starts.
            for handle in handles {
                let (mut tm, result, duration_ms) = handle.await.map_err(|e| {
                    MigrateError::Unknown(format!("table worker panicked: {e}"))
                })?;
                let (outcome, error) = match result {
                    Ok(outcome) => {
                        tm.mark_completed();
                        (outcome, None)
                    }
                    Err(MigrateError::Cancelled) => {
                        cancelled = true;
                        tm.migration_state = MigrationState::Pending;
                        (BatchOutcome::default(), Some("cancelled".to_string()))
                    }
                    Err(e) => {
                        let message = e.to_string();
                        warn!(table = %tm.source_table, "Table failed: {message}");
                        tm.mark_error(&message);
                        for dependent in resolver.dependents_of(&tm.source_table) {
                            blocked.insert(dependent);
                        }
                        (BatchOutcome::default(), Some(message))
                    }
                };
                reports.push(TableReport {
                    table: tm.source_table.clone(),
                    entity_type: tm.target_entity_type.clone().unwrap_or_default(),
                    outcome,
                    state: tm.migration_state,
                    error,
                    duration_ms,
                });
                self.project.upsert_table(tm);
                self.save_project()?;
            }

            if cancelled {
                break 'layers;
            }
        }

        let status = if cancelled {
            RunStatus::Cancelled
        } else if reports
            .iter()
            .any(|r| r.state == MigrationState::Error)
        {
            RunStatus::CompletedWithErrors
        } else {
            RunStatus::Completed
        };

        let report = MigrationReport {
            run_id,
            project: self.project.name.clone(),
            status,
            has_cycle: order.has_cycle,
            started_at,
            finished_at: Utc::now(),
            tables: reports,
        };
        let totals = report.totals();
        info!(
            run_id = %run_id,
            status = ?report.status,
            success = totals.success,
            errors = totals.errors,
            "Migration run finished"
        );
        Ok(report)
    }

    /// Re-attempt one quarantined row right now. Returns true when the row
    /// migrated, false when it failed again (burning one retry).
    pub async fn retry_error(&mut self, id: Uuid) -> Result<bool> {
        let record = self
            .quarantine
            .get(id)
            .ok_or_else(|| MigrateError::State(format!("no quarantined record with id {id}")))?;
        if !record.can_retry() {
            return Err(MigrateError::State(format!(
                "record {id} is {:?} with no retries left",
                record.state
            )));
        }

        let tm = self
            .project
            .table(&record.source_table)
            .cloned()
            .ok_or_else(|| {
                MigrateError::Config(format!("unknown table {}", record.source_table))
            })?;
        let entity_type = tm.target_entity_type.clone().ok_or_else(|| {
            MigrateError::Config(format!("table {} is not mapped", record.source_table))
        })?;
        let schema = self.target.describe_schema(&entity_type).await?;

        let loader = BatchLoader::new(
            self.source.clone(),
            self.target.clone(),
            self.identity.clone(),
            self.quarantine.clone(),
            self.config.migration.clone(),
        );
        match loader.load_row(&tm, &schema, &record.row).await {
            Ok(_) => {
                self.quarantine.record_retry(id, Ok(()))?;
                if let Some(tm) = self.project.table_mut(&record.source_table) {
                    tm.migrated_records += 1;
                    tm.error_records = tm.error_records.saturating_sub(1);
                }
                self.quarantine.save()?;
                self.identity.save()?;
                self.save_project()?;
                Ok(true)
            }
            Err(e) => {
                self.quarantine.record_retry(id, Err(&e))?;
                self.quarantine.save()?;
                Ok(false)
            }
        }
    }

    /// Operator action: drop a quarantined row from the retry pool.
    pub fn ignore_error(&self, id: Uuid) -> Result<()> {
        self.quarantine.ignore(id)?;
        self.quarantine.save()
    }

    fn runnable_snapshot(&self) -> Vec<TableMapping> {
        self.project
            .runnable_tables()
            .into_iter()
            .cloned()
            .collect()
    }

    async fn entity_schemas(&self) -> Result<HashMap<String, EntitySchema>> {
        let mut schemas = HashMap::new();
        for tm in self.project.runnable_tables() {
            if let Some(ref entity) = tm.target_entity_type {
                if !schemas.contains_key(entity) {
                    let schema = self.target.describe_schema(entity).await?;
                    schemas.insert(entity.clone(), schema);
                }
            }
        }
        Ok(schemas)
    }

    /// Like [`entity_schemas`](Self::entity_schemas), but an entity type
    /// the target cannot describe becomes a recorded failure instead of
    /// an error, so the rest of the run can proceed without it.
    async fn entity_schemas_lenient(
        &self,
    ) -> (HashMap<String, EntitySchema>, HashMap<String, String>) {
        let mut schemas = HashMap::new();
        let mut failures = HashMap::new();
        for tm in self.project.runnable_tables() {
            let Some(ref entity) = tm.target_entity_type else {
                continue;
            };
            if schemas.contains_key(entity) || failures.contains_key(entity) {
                continue;
            }
            match self.target.describe_schema(entity).await {
                Ok(schema) => {
                    schemas.insert(entity.clone(), schema);
                }
                Err(e) => {
                    warn!(entity = %entity, "Cannot describe entity type: {e}");
                    failures.insert(entity.clone(), e.to_string());
                }
            }
        }
        (schemas, failures)
    }

    async fn validate_with(
        &self,
        mappings: &[TableMapping],
        schemas: &HashMap<String, EntitySchema>,
    ) -> Result<Vec<DependencyIssue>> {
        let mapped: BTreeSet<&str> = mappings
            .iter()
            .filter_map(|tm| tm.target_entity_type.as_deref())
            .collect();

        let mut counts: HashMap<String, i64> = HashMap::new();
        for schema in schemas.values() {
            for field in &schema.fields {
                if !field.required {
                    continue;
                }
                let Some(relation) = field.field_type.relation() else {
                    continue;
                };
                if mapped.contains(relation) || counts.contains_key(relation) {
                    continue;
                }
                counts.insert(relation.to_string(), self.target.count(relation).await?);
            }
        }

        Ok(resolver::validate_dependencies(mappings, schemas, &counts))
    }

    fn save_project(&mut self) -> Result<()> {
        if let Some(path) = self.project_path.clone() {
            self.project.save(path)?;
        }
        Ok(())
    }
}

//! Batch loader: fetches source rows page by page, transforms them, and
//! writes them to the target store with per-row error isolation.
//!
//! A row that fails transforms or loading is quarantined and counted; the
//! rest of its batch continues. Whole-batch failures (timeouts, fetch
//! errors) retry with exponential backoff before giving up. The identity
//! map makes re-runs idempotent: rows seen before are updated in place.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::connect::{Cursor, SourceConnector, TargetStore};
use crate::core::{EntitySchema, Record};
use crate::error::{MigrateError, Result};
use crate::identity::IdentityMap;
use crate::mapping::TableMapping;
use crate::quarantine::Quarantine;
use crate::transform::{FieldTransformer, PrefetchCache};

/// Cooperative run control, observed at batch boundaries only. Rows within
/// a batch always run to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Cancel,
}

/// Counters for one batch or one table. `success == created + updated`,
/// and every fetched row lands in exactly one of success or errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub success: u64,
    pub created: u64,
    pub updated: u64,
    pub errors: u64,
}

impl BatchOutcome {
    pub fn merge(&mut self, other: BatchOutcome) {
        self.success += other.success;
        self.created += other.created;
        self.updated += other.updated;
        self.errors += other.errors;
    }
}

/// Executes the migration of one table end to end.
pub struct BatchLoader {
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetStore>,
    identity: Arc<IdentityMap>,
    quarantine: Arc<Quarantine>,
    transformer: FieldTransformer,
    config: MigrationConfig,
}

impl BatchLoader {
    pub fn new(
        source: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetStore>,
        identity: Arc<IdentityMap>,
        quarantine: Arc<Quarantine>,
        config: MigrationConfig,
    ) -> Self {
        let transformer = FieldTransformer::new(target.clone(), identity.clone());
        Self {
            source,
            target,
            identity,
            quarantine,
            transformer,
            config,
        }
    }

    /// Migrate one mapped table: retry its quarantined rows, then stream
    /// fresh pages from the source. Updates the mapping's counters in place
    /// and persists the identity map at the end.
    pub async fn migrate_table(
        &self,
        mapping: &mut TableMapping,
        schema: &EntitySchema,
        control: &mut watch::Receiver<Control>,
    ) -> Result<BatchOutcome> {
        let entity_type = mapping.target_entity_type.clone().ok_or_else(|| {
            MigrateError::Config(format!(
                "table {} has no target entity type",
                mapping.source_table
            ))
        })?;
        let batch_size = mapping.batch_size.unwrap_or(self.config.get_batch_size());

        info!(
            table = %mapping.source_table,
            entity = %entity_type,
            rows = mapping.row_count,
            batch_size,
            "Migrating table"
        );

        // Counters reflect this run only; a re-run starts from zero instead
        // of stacking onto the previous attempt.
        mapping.migrated_records = 0;
        mapping.error_records = 0;

        // Quarantined rows handled here are skipped when their page comes
        // back around, so each source row is counted exactly once per run.
        // Tables without a primary key cannot be matched back to their
        // quarantine snapshots; their retries stay with the operator.
        let mut retried: HashSet<String> = HashSet::new();
        let mut totals = if mapping.pk_columns().is_empty() {
            BatchOutcome::default()
        } else {
            self.retry_quarantined(mapping, schema, &entity_type, &mut retried)
                .await?
        };

        let mut cursor: Option<Cursor> = None;
        loop {
            honor_control(control).await?;

            let page = self
                .fetch_with_retry(&mapping.source_table, cursor.as_ref(), batch_size)
                .await?;
            if !page.rows.is_empty() {
                let outcome = self
                    .process_batch_with_retry(mapping, schema, &entity_type, &page.rows, &retried)
                    .await;
                mapping.migrated_records += outcome.success as i64;
                mapping.error_records += outcome.errors as i64;
                totals.merge(outcome);
            }

            match page.next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        self.identity.save()?;
        self.quarantine.save()?;

        info!(
            table = %mapping.source_table,
            success = totals.success,
            created = totals.created,
            updated = totals.updated,
            errors = totals.errors,
            "Table done"
        );
        Ok(totals)
    }

    /// Transform and load a single row outside the batch loop, for one-off
    /// quarantine retries.
    pub async fn load_row(
        &self,
        mapping: &TableMapping,
        schema: &EntitySchema,
        row: &Record,
    ) -> Result<bool> {
        let entity_type = mapping.target_entity_type.clone().ok_or_else(|| {
            MigrateError::Config(format!(
                "table {} has no target entity type",
                mapping.source_table
            ))
        })?;
        let mut cache = self.transformer.prefetch(mapping)?;
        self.attempt_row(mapping, schema, &entity_type, row, &mut cache)
            .await
    }

    /// Re-attempt the table's pending quarantined rows before fresh pages,
    /// so fixed mappings heal old failures on the next run. Every pending
    /// row lands in `handled`, keeping the page loop from counting it (or
    /// quarantining it a second time) in the same run.
    async fn retry_quarantined(
        &self,
        mapping: &mut TableMapping,
        schema: &EntitySchema,
        entity_type: &str,
        handled: &mut HashSet<String>,
    ) -> Result<BatchOutcome> {
        let pending = self.quarantine.pending_for_table(&mapping.source_table);
        if pending.is_empty() {
            return Ok(BatchOutcome::default());
        }

        info!(
            table = %mapping.source_table,
            count = pending.len(),
            "Retrying quarantined rows"
        );

        let mut cache = self.transformer.prefetch(mapping)?;
        let mut totals = BatchOutcome::default();
        for record in pending {
            if !handled.insert(record.source_id.clone()) {
                continue;
            }
            if !record.can_retry() {
                // Out of retries; the row stays with the operator but still
                // counts against this run.
                totals.errors += 1;
                mapping.error_records += 1;
                continue;
            }
            match self
                .attempt_row(mapping, schema, entity_type, &record.row, &mut cache)
                .await
            {
                Ok(created) => {
                    self.quarantine.record_retry(record.id, Ok(()))?;
                    totals.success += 1;
                    if created {
                        totals.created += 1;
                    } else {
                        totals.updated += 1;
                    }
                    mapping.migrated_records += 1;
                }
                Err(e) => {
                    self.quarantine.record_retry(record.id, Err(&e))?;
                    totals.errors += 1;
                    mapping.error_records += 1;
                }
            }
        }
        Ok(totals)
    }

    async fn fetch_with_retry(
        &self,
        table: &str,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<crate::connect::RowPage> {
        let max_retries = self.config.get_max_retries();
        let mut delay = Duration::from_millis(self.config.get_retry_delay_ms());

        let mut attempt = 0;
        loop {
            match self.source.fetch_rows(table, cursor, limit).await {
                Ok(page) => return Ok(page),
                Err(e) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        table = %table,
                        attempt,
                        "Fetch failed, retrying in {:?}: {e}",
                        delay
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Process one batch under the configured timeout, retrying the whole
    /// batch with backoff. Identity-map upserts keep re-processing safe.
    /// When the retry budget is exhausted every row of the batch is
    /// quarantined so the table can keep going.
    async fn process_batch_with_retry(
        &self,
        mapping: &TableMapping,
        schema: &EntitySchema,
        entity_type: &str,
        rows: &[Record],
        skip: &HashSet<String>,
    ) -> BatchOutcome {
        let max_retries = self.config.get_max_retries();
        let mut delay = Duration::from_millis(self.config.get_retry_delay_ms());
        let budget = Duration::from_secs(self.config.get_batch_timeout_secs());

        let mut attempt = 0;
        loop {
            let work = self.process_batch(mapping, schema, entity_type, rows, skip);
            match timeout(budget, work).await {
                Ok(Ok(outcome)) => return outcome,
                Ok(Err(e)) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        table = %mapping.source_table,
                        attempt,
                        "Batch failed, retrying in {:?}: {e}",
                        delay
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(_) if attempt < max_retries => {
                    attempt += 1;
                    warn!(
                        table = %mapping.source_table,
                        attempt,
                        "Batch timed out after {:?}, retrying",
                        budget
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
                Ok(Err(e)) => return self.quarantine_batch(mapping, rows, &e),
                Err(_) => {
                    let e = MigrateError::Timeout {
                        table: mapping.source_table.clone(),
                        seconds: self.config.get_batch_timeout_secs(),
                    };
                    return self.quarantine_batch(mapping, rows, &e);
                }
            }
        }
    }

    /// Transform and load one batch. Per-row failures are quarantined and
    /// counted; only infrastructure failures (prefetch, expression compile)
    /// abort the batch.
    async fn process_batch(
        &self,
        mapping: &TableMapping,
        schema: &EntitySchema,
        entity_type: &str,
        rows: &[Record],
        skip: &HashSet<String>,
    ) -> Result<BatchOutcome> {
        let mut cache = self.transformer.prefetch(mapping)?;
        let mut outcome = BatchOutcome::default();

        for row in rows {
            let source_id = row_source_id(mapping, row);
            if skip.contains(&source_id) {
                continue;
            }
            match self
                .attempt_row(mapping, schema, entity_type, row, &mut cache)
                .await
            {
                Ok(created) => {
                    outcome.success += 1;
                    if created {
                        outcome.created += 1;
                    } else {
                        outcome.updated += 1;
                    }
                }
                Err(e) => {
                    self.quarantine
                        .capture(&mapping.source_table, &source_id, row.clone(), &e);
                    outcome.errors += 1;
                }
            }
        }

        debug!(
            table = %mapping.source_table,
            success = outcome.success,
            errors = outcome.errors,
            "Batch done"
        );
        Ok(outcome)
    }

    /// Migrate one row. Returns true when a record was created, false when
    /// an existing one was updated. Rows from tables without a primary key
    /// are never identity-mapped and always insert.
    async fn attempt_row(
        &self,
        mapping: &TableMapping,
        schema: &EntitySchema,
        entity_type: &str,
        row: &Record,
        cache: &mut PrefetchCache,
    ) -> Result<bool> {
        let source_id = if mapping.pk_columns().is_empty() {
            None
        } else {
            Some(row_source_id(mapping, row))
        };
        let existing = source_id
            .as_deref()
            .and_then(|sid| self.identity.get(&mapping.source_table, sid));

        let record = self
            .transformer
            .transform_row(mapping, schema, row, cache)
            .await?;

        match existing {
            Some(target_id) => {
                self.target.update(entity_type, target_id, record).await?;
                if let Some(sid) = source_id.as_deref() {
                    self.identity
                        .put(&mapping.source_table, sid, entity_type, target_id);
                }
                Ok(false)
            }
            None => {
                let target_id = self.target.create(entity_type, record).await?;
                if let Some(sid) = source_id.as_deref() {
                    self.identity
                        .put(&mapping.source_table, sid, entity_type, target_id);
                }
                Ok(true)
            }
        }
    }

    fn quarantine_batch(
        &self,
        mapping: &TableMapping,
        rows: &[Record],
        error: &MigrateError,
    ) -> BatchOutcome {
        warn!(
            table = %mapping.source_table,
            rows = rows.len(),
            "Quarantining whole batch: {error}"
        );
        for row in rows {
            let source_id = row_source_id(mapping, row);
            self.quarantine
                .capture(&mapping.source_table, &source_id, row.clone(), error);
        }
        BatchOutcome {
            errors: rows.len() as u64,
            ..BatchOutcome::default()
        }
    }
}

/// Stringified primary key of a source row; composite keys join with `-`,
/// tables with no key yield `?` (such rows never get identity mappings and
/// always insert).
pub fn row_source_id(mapping: &TableMapping, row: &Record) -> String {
    let pk_columns = mapping.pk_columns();
    if pk_columns.is_empty() {
        return "?".to_string();
    }
    pk_columns
        .iter()
        .map(|c| {
            row.get(*c)
                .map(|v| v.to_text())
                .unwrap_or_else(|| "?".to_string())
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Wait out a pause, fail on cancel. The borrow is released before any
/// await point.
pub async fn honor_control(control: &mut watch::Receiver<Control>) -> Result<()> {
    loop {
        let state = *control.borrow();
        match state {
            Control::Run => return Ok(()),
            Control::Cancel => return Err(MigrateError::Cancelled),
            Control::Pause => {
                if control.changed().await.is_err() {
                    // Controller dropped while paused.
                    return Err(MigrateError::Cancelled);
                }
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sheetgres_core::{
    check_outbound_columns, db_to_sheet, fingerprint, key_from_row, project_db_row,
    BackoffPolicy, ChangeAction, Direction, FailureKind, Ledger, QueueRow, RowMap, TablePair,
};
use sheetgres_pg::{PgResult, SyncStore};
use sheetgres_sheet::{RateLimiter, SheetClient, SheetError};

use crate::metrics::Metrics;
use crate::supervisor::PairHealth;

/// Classify a Sheet error into the supervisor's failure taxonomy.
pub(crate) fn sheet_failure_kind(e: &SheetError) -> FailureKind {
    match e {
        SheetError::Network(_) => FailureKind::TransientNetwork,
        SheetError::RateLimited { .. } => FailureKind::RateLimited,
        SheetError::NotFound(_) => FailureKind::NotFound,
        SheetError::Unauthorized => FailureKind::Fatal,
        SheetError::Api { .. } | SheetError::InvalidRecord(_) | SheetError::Json(_) => {
            FailureKind::Mapping
        }
    }
}

enum SheetWrite {
    Applied,
    AlreadyAbsent,
}

/// DB-side queue consumer: claims trigger-enqueued rows and replays them
/// onto the Sheet. Several worker tasks may share one consumer; the claim
/// statement guarantees no row is taken twice.
pub struct Consumer<C: SheetClient, S: SyncStore> {
    pairs_by_table: HashMap<String, TablePair>,
    client: Arc<C>,
    store: Arc<S>,
    ledger: Arc<Ledger>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    health: HashMap<String, Arc<PairHealth>>,
    /// Shared with the watchdog, which widens it under backlog.
    batch_size: Arc<AtomicI64>,
    retry_max: i32,
    backoff: BackoffPolicy,
    tick: Duration,
}

impl<C: SheetClient, S: SyncStore> Consumer<C, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pairs: &[TablePair],
        client: Arc<C>,
        store: Arc<S>,
        ledger: Arc<Ledger>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
        health: HashMap<String, Arc<PairHealth>>,
        batch_size: Arc<AtomicI64>,
        retry_max: i32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            pairs_by_table: pairs
                .iter()
                .map(|p| (p.db_table.clone(), p.clone()))
                .collect(),
            client,
            store,
            ledger,
            limiter,
            metrics,
            health,
            batch_size,
            retry_max,
            backoff,
            tick: Duration::from_secs(1),
        }
    }

    /// Worker loop: claim and process until shutdown.
    pub async fn run(self: Arc<Self>, worker: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(worker, "Queue consumer started");

        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    match self.drain_once().await {
                        Ok(0) => {}
                        Ok(processed) => debug!(worker, processed, "Drained queue batch"),
                        Err(e) => warn!(worker, error = %e, "Queue claim failed"),
                    }
                }
            }
        }

        info!(worker, "Queue consumer stopped");
    }

    /// Claim one batch and process it in order. Returns rows processed.
    pub async fn drain_once(&self) -> PgResult<usize> {
        let batch_size = self.batch_size.load(Ordering::Relaxed);
        let rows = self.store.claim_pending(batch_size, self.retry_max).await?;

        let count = rows.len();
        for row in rows {
            self.process_row(row).await;
        }
        Ok(count)
    }

    async fn process_row(&self, row: QueueRow) {
        let Some(pair) = self.pairs_by_table.get(&row.table_name) else {
            warn!(table = %row.table_name, id = row.id, "No pair configured for table");
            self.fail_permanently(&row, "no pair configured for table", FailureKind::Mapping)
                .await;
            return;
        };
        let pair = pair.clone();

        let Some(payload) = row.payload() else {
            self.fail_permanently(&row, "queue row has no payload", FailureKind::Mapping)
                .await;
            return;
        };

        // Schema drift: a payload column the field map does not know cannot
        // travel to the Sheet. Fails the row, never retried.
        if let Err(e) = check_outbound_columns(&pair, payload) {
            warn!(id = row.id, table = %row.table_name, error = %e, "Payload does not map");
            self.fail_permanently(&row, &e.to_string(), FailureKind::Mapping)
                .await;
            return;
        }

        // The trigger's hash is advisory: key order in its JSON is not
        // pinned, so the consumer always recomputes on the mapped payload.
        let row_map = project_db_row(&pair, payload);
        let fp = fingerprint(&row_map);
        if let Some(trigger_hash) = &row.sync_hash {
            if trigger_hash != &fp {
                debug!(
                    id = row.id,
                    trigger_hash = %trigger_hash,
                    recomputed = %fp,
                    "Trigger hash mismatch, using recomputed fingerprint"
                );
            }
        }

        // Echo check: did the poller just write this content into the DB?
        let echo = self.ledger.should_skip(&fp, Direction::SheetToDb) || {
            match self
                .store
                .loop_recorded(&fp, Direction::SheetToDb, self.ledger.window())
                .await
            {
                Ok(recorded) => recorded,
                Err(e) => {
                    self.retry_row(&row, &e.to_string(), e.failure_kind(), None).await;
                    return;
                }
            }
        };

        if echo {
            debug!(id = row.id, record = %row.record_id, "Echo suppressed");
            if let Err(e) = self
                .store
                .mark_completed(row.id, Some("loop_suppressed"))
                .await
            {
                warn!(id = row.id, error = %e, "Failed to mark row completed");
            }
            self.metrics.record_skip("loop_suppressed");
            return;
        }

        // A payload without a usable key value cannot address a Sheet
        // record. Same policy as any other mapping failure: fail the row,
        // do not retry.
        let key = match key_from_row(&pair, &row_map) {
            Ok(key) => key,
            Err(e) => {
                warn!(
                    id = row.id,
                    table = %row.table_name,
                    record = %row.record_id,
                    error = %e,
                    "Queue payload has no usable key"
                );
                self.fail_permanently(&row, &e.to_string(), FailureKind::Mapping)
                    .await;
                return;
            }
        };

        match self.write_to_sheet(&pair, &row, &key, &row_map).await {
            Ok(SheetWrite::Applied) => {
                self.ledger.remember(&fp, Direction::DbToSheet);
                let _ = self
                    .store
                    .record_sync(
                        &pair.db_table,
                        &key,
                        Direction::DbToSheet,
                        &fp,
                        "completed",
                        None,
                    )
                    .await;
                if let Err(e) = self.store.mark_completed(row.id, None).await {
                    warn!(id = row.id, error = %e, "Failed to mark row completed");
                }

                let latency = (Utc::now() - row.created_at).to_std().unwrap_or_default();
                self.metrics.record_success(Direction::DbToSheet, latency);
                self.record_health(&pair, true);
                info!(
                    pair = %pair.name,
                    action = row.action.as_str(),
                    key = %key,
                    "Applied queue row to Sheet"
                );
            }
            Ok(SheetWrite::AlreadyAbsent) => {
                if let Err(e) = self
                    .store
                    .mark_completed(row.id, Some("already_absent"))
                    .await
                {
                    warn!(id = row.id, error = %e, "Failed to mark row completed");
                }
                self.metrics.record_skip("already_absent");
            }
            Err(e) => {
                let kind = sheet_failure_kind(&e);
                self.record_health(&pair, false);

                if let SheetError::RateLimited { retry_after } = &e {
                    self.limiter.throttle(Duration::from_secs(60));
                    if kind.is_retryable() {
                        self.retry_row(&row, &e.to_string(), kind, *retry_after).await;
                        return;
                    }
                }

                if kind.is_retryable() {
                    self.retry_row(&row, &e.to_string(), kind, None).await;
                } else {
                    let _ = self
                        .store
                        .record_sync(
                            &pair.db_table,
                            &key,
                            Direction::DbToSheet,
                            &fp,
                            "failed",
                            Some(&e.to_string()),
                        )
                        .await;
                    self.fail_permanently(&row, &e.to_string(), kind).await;
                }
            }
        }
    }

    async fn write_to_sheet(
        &self,
        pair: &TablePair,
        row: &QueueRow,
        key: &str,
        row_map: &RowMap,
    ) -> Result<SheetWrite, SheetError> {
        match row.action {
            ChangeAction::Insert => {
                self.create_on_sheet(pair, key, row_map).await?;
                Ok(SheetWrite::Applied)
            }
            ChangeAction::Update => {
                match self.resolve_external_id(pair, key).await? {
                    Some(external_id) => {
                        let fields = db_to_sheet(pair, row_map);
                        self.limiter.acquire().await;
                        match self
                            .client
                            .update_record(&pair.sheet_db, &pair.sheet_table, &external_id, fields)
                            .await
                        {
                            Ok(()) => Ok(SheetWrite::Applied),
                            Err(SheetError::NotFound(_)) => {
                                // Mapping was stale; the record is gone.
                                debug!(key = %key, "Update target vanished, degrading to insert");
                                self.create_on_sheet(pair, key, row_map).await?;
                                Ok(SheetWrite::Applied)
                            }
                            Err(e) => Err(e),
                        }
                    }
                    None => {
                        debug!(key = %key, "No Sheet record for update, degrading to insert");
                        self.create_on_sheet(pair, key, row_map).await?;
                        Ok(SheetWrite::Applied)
                    }
                }
            }
            ChangeAction::Delete => {
                match self.resolve_external_id(pair, key).await? {
                    None => Ok(SheetWrite::AlreadyAbsent),
                    Some(external_id) => {
                        self.limiter.acquire().await;
                        match self
                            .client
                            .delete_record(&pair.sheet_db, &pair.sheet_table, &external_id)
                            .await
                        {
                            Ok(()) => Ok(SheetWrite::Applied),
                            Err(SheetError::NotFound(_)) => Ok(SheetWrite::AlreadyAbsent),
                            Err(e) => Err(e),
                        }
                    }
                }
            }
        }
    }

    async fn create_on_sheet(
        &self,
        pair: &TablePair,
        key: &str,
        row_map: &RowMap,
    ) -> Result<(), SheetError> {
        let fields = db_to_sheet(pair, row_map);
        self.limiter.acquire().await;
        let external_id = self
            .client
            .create_record(&pair.sheet_db, &pair.sheet_table, fields)
            .await?;

        if let Err(e) = self
            .store
            .save_id_mapping(&pair.name, key, &external_id)
            .await
        {
            warn!(pair = %pair.name, key = %key, error = %e, "Failed to save id mapping");
        }
        Ok(())
    }

    /// Resolve the Sheet record id for a key: id mapping first, then a
    /// Sheet query on the key field.
    async fn resolve_external_id(
        &self,
        pair: &TablePair,
        key: &str,
    ) -> Result<Option<String>, SheetError> {
        match self.store.external_id_for(&pair.name, key).await {
            Ok(Some(external_id)) => return Ok(Some(external_id)),
            Ok(None) => {}
            Err(e) => warn!(pair = %pair.name, error = %e, "id mapping lookup failed"),
        }

        let Some(sheet_key_field) = pair.field_map.sheet_field(&pair.key_field) else {
            return Ok(None);
        };

        self.limiter.acquire().await;
        let found = self
            .client
            .query_records(
                &pair.sheet_db,
                &pair.sheet_table,
                sheet_key_field,
                &serde_json::Value::String(key.to_string()),
            )
            .await?;

        match found.first() {
            Some(record) => {
                if let Err(e) = self
                    .store
                    .save_id_mapping(&pair.name, key, &record.id)
                    .await
                {
                    warn!(pair = %pair.name, error = %e, "Failed to save recovered id mapping");
                }
                Ok(Some(record.id.clone()))
            }
            None => Ok(None),
        }
    }

    async fn retry_row(
        &self,
        row: &QueueRow,
        error: &str,
        kind: FailureKind,
        delay_override: Option<Duration>,
    ) {
        let delay = delay_override.unwrap_or_else(|| self.backoff.delay(row.retry_count as u32));
        match self
            .store
            .mark_failed(row.id, error, self.retry_max, delay)
            .await
        {
            Ok(status) => debug!(
                id = row.id,
                status = status.as_str(),
                delay_s = delay.as_secs(),
                "Queue row scheduled for retry"
            ),
            Err(e) => warn!(id = row.id, error = %e, "Failed to reschedule row"),
        }
        self.metrics.record_failure(Direction::DbToSheet, kind);
    }

    async fn fail_permanently(&self, row: &QueueRow, error: &str, kind: FailureKind) {
        // retry_max of zero forces the terminal state.
        if let Err(e) = self.store.mark_failed(row.id, error, 0, Duration::ZERO).await {
            warn!(id = row.id, error = %e, "Failed to mark row failed");
        }
        self.metrics.record_failure(Direction::DbToSheet, kind);
    }

    fn record_health(&self, pair: &TablePair, success: bool) {
        if let Some(health) = self.health.get(&pair.db_table) {
            health.record(success);
        }
    }
}

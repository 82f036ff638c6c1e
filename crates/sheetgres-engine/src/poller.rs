use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sheetgres_core::{
    diff, fingerprint, fingerprint_raw, sheet_to_db, ChangeAction, ChangeEvent, Direction,
    FailureKind, Ledger, RowMap, Snapshot, TablePair,
};
use sheetgres_pg::SyncStore;
use sheetgres_sheet::client::list_all_records;
use sheetgres_sheet::{RateLimiter, SheetClient, SheetError};

use crate::consumer::sheet_failure_kind;
use crate::metrics::Metrics;
use crate::snapshot::SnapshotStore;
use crate::supervisor::PairHealth;

/// What one poll cycle did.
#[derive(Debug, Default, PartialEq)]
pub struct PollOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Sheet-side change detector for one table pair.
///
/// Each tick reads the whole Sheet table, projects every record through the
/// field map, and diffs fingerprints against the snapshot. Surviving
/// changes are applied to the DB, with the anti-loop ledger consulted
/// first so the engine's own recent Sheet writes are not echoed back.
pub struct Poller<C: SheetClient, S: SyncStore> {
    pair: TablePair,
    client: Arc<C>,
    store: Arc<S>,
    ledger: Arc<Ledger>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    snapshots: Arc<SnapshotStore>,
    health: Arc<PairHealth>,
    retry_max: u32,
    snapshot: Snapshot,
    initialized: bool,
    /// Consecutive transient failures per external id. A record past the
    /// retry budget is given up on: its snapshot entry advances so it is
    /// not retried forever.
    failure_streaks: HashMap<String, u32>,
}

impl<C: SheetClient, S: SyncStore> Poller<C, S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: TablePair,
        client: Arc<C>,
        store: Arc<S>,
        ledger: Arc<Ledger>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<Metrics>,
        snapshots: Arc<SnapshotStore>,
        health: Arc<PairHealth>,
        retry_max: u32,
    ) -> Self {
        let (snapshot, initialized) = match snapshots.load(&pair.name) {
            Some(snapshot) => {
                info!(pair = %pair.name, records = snapshot.len(), "Loaded persisted snapshot");
                (snapshot, true)
            }
            None => (Snapshot::new(), false),
        };

        Self {
            pair,
            client,
            store,
            ledger,
            limiter,
            metrics,
            snapshots,
            health,
            retry_max,
            snapshot,
            initialized,
            failure_streaks: HashMap::new(),
        }
    }

    /// Poll until the shutdown signal fires. Overlapping ticks are skipped,
    /// not queued.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pair = %self.pair.name,
            interval_s = self.pair.poll_interval.as_secs(),
            "Poller started"
        );

        let mut interval = tokio::time::interval(self.pair.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {
                    if self.health.is_paused() {
                        debug!(pair = %self.pair.name, "Pair paused, skipping poll");
                        continue;
                    }

                    let started = Instant::now();
                    match self.poll_once().await {
                        Ok(outcome) => {
                            if outcome != PollOutcome::default() {
                                debug!(
                                    pair = %self.pair.name,
                                    applied = outcome.applied,
                                    skipped = outcome.skipped,
                                    failed = outcome.failed,
                                    "Poll cycle done"
                                );
                            }
                        }
                        Err(e) => {
                            warn!(pair = %self.pair.name, error = %e, "Sheet read failed");
                            if let SheetError::RateLimited { .. } = e {
                                self.limiter.throttle(std::time::Duration::from_secs(60));
                            }
                            self.metrics
                                .record_failure(Direction::SheetToDb, sheet_failure_kind(&e));
                            self.health.record(false);
                        }
                    }

                    if started.elapsed() > self.pair.poll_interval {
                        self.metrics.incr_poll_overruns();
                    }
                }
            }
        }

        info!(pair = %self.pair.name, "Poller stopped");
    }

    /// One full read-diff-apply cycle.
    pub async fn poll_once(&mut self) -> Result<PollOutcome, SheetError> {
        self.limiter.acquire().await;
        let records =
            list_all_records(&*self.client, &self.pair.sheet_db, &self.pair.sheet_table).await?;

        // Project every record; mapping failures still get a stable
        // fingerprint so they stay in the snapshot.
        let mut current: Vec<(String, String)> = Vec::with_capacity(records.len());
        let mut rows: HashMap<String, Option<(String, RowMap)>> = HashMap::new();

        for record in &records {
            match sheet_to_db(&self.pair, &record.fields) {
                Ok((key, row)) => {
                    current.push((record.id.clone(), fingerprint(&row)));
                    rows.insert(record.id.clone(), Some((key, row)));
                }
                Err(e) => {
                    let raw = serde_json::Value::Object(
                        record.fields.clone().into_iter().collect(),
                    );
                    current.push((record.id.clone(), fingerprint_raw(&raw)));
                    rows.insert(record.id.clone(), None);
                    debug!(
                        pair = %self.pair.name,
                        record = %record.id,
                        error = %e,
                        "Record does not map"
                    );
                }
            }
        }

        // Cold start: seed the snapshot without emitting events. A full
        // resync is an explicit operator action (reset-snapshot), not a
        // startup side effect.
        if !self.initialized {
            let mut outcome = PollOutcome::default();
            for (external_id, fp) in &current {
                self.snapshot.insert(external_id.clone(), fp.clone());
                self.metrics.record_skip("cold_start_identical");
                outcome.skipped += 1;
            }
            self.initialized = true;
            self.persist_snapshot();
            info!(
                pair = %self.pair.name,
                records = self.snapshot.len(),
                "Cold start, snapshot seeded"
            );
            return Ok(outcome);
        }

        let fingerprints: HashMap<&str, &str> = current
            .iter()
            .map(|(id, fp)| (id.as_str(), fp.as_str()))
            .collect();

        let changes = diff(&current, &self.snapshot);
        let mut outcome = PollOutcome::default();
        let mut dirty = false;

        for (action, external_id) in changes {
            let fp = match action {
                ChangeAction::Delete => self
                    .snapshot
                    .get(&external_id)
                    .unwrap_or_default()
                    .to_string(),
                _ => fingerprints
                    .get(external_id.as_str())
                    .unwrap_or(&"")
                    .to_string(),
            };

            let advanced = self
                .handle_change(action, &external_id, &fp, &rows, &mut outcome)
                .await;
            dirty |= advanced;
        }

        if dirty {
            self.persist_snapshot();
        }
        Ok(outcome)
    }

    /// Apply one detected change. Returns whether the snapshot advanced.
    async fn handle_change(
        &mut self,
        action: ChangeAction,
        external_id: &str,
        fp: &str,
        rows: &HashMap<String, Option<(String, RowMap)>>,
        outcome: &mut PollOutcome,
    ) -> bool {
        // Echo check: was this exact content just written to the Sheet by
        // the queue consumer? L1 first, then the sync_log tier.
        let echo = self.ledger.should_skip(fp, Direction::DbToSheet) || {
            match self
                .store
                .loop_recorded(fp, Direction::DbToSheet, self.ledger.window())
                .await
            {
                Ok(recorded) => recorded,
                Err(e) => {
                    warn!(pair = %self.pair.name, error = %e, "Ledger lookup failed");
                    self.metrics
                        .record_failure(Direction::SheetToDb, e.failure_kind());
                    outcome.failed += 1;
                    return false;
                }
            }
        };

        if echo {
            self.metrics.record_skip("loop");
            outcome.skipped += 1;
            return self.advance_snapshot(action, external_id, fp);
        }

        // Resolve payload and key.
        let (key_value, row) = match action {
            ChangeAction::Delete => {
                match self.store.key_for(&self.pair.name, external_id).await {
                    Ok(Some(key)) => (Some(key), None),
                    Ok(None) => {
                        // Never synced to the DB; nothing to delete there.
                        debug!(
                            pair = %self.pair.name,
                            record = external_id,
                            "Deleted record has no id mapping"
                        );
                        self.metrics.record_skip("already_absent");
                        outcome.skipped += 1;
                        return self.advance_snapshot(action, external_id, fp);
                    }
                    Err(e) => {
                        self.metrics
                            .record_failure(Direction::SheetToDb, e.failure_kind());
                        self.health.record(false);
                        outcome.failed += 1;
                        return false;
                    }
                }
            }
            _ => match rows.get(external_id) {
                Some(Some((key, row))) => (Some(key.clone()), Some(row.clone())),
                _ => {
                    // Mapping failure: permanent. Record it and move on so
                    // the row is not re-reported every poll.
                    warn!(
                        pair = %self.pair.name,
                        record = external_id,
                        "Mapping failed, marking record failed"
                    );
                    self.metrics
                        .record_failure(Direction::SheetToDb, FailureKind::Mapping);
                    let _ = self
                        .store
                        .record_sync(
                            &self.pair.db_table,
                            external_id,
                            Direction::SheetToDb,
                            fp,
                            "failed",
                            Some("field mapping failed"),
                        )
                        .await;
                    outcome.failed += 1;
                    return self.advance_snapshot(action, external_id, fp);
                }
            },
        };

        let event = ChangeEvent {
            action,
            external_id: external_id.to_string(),
            key_value: key_value.clone(),
            row,
            fingerprint: fp.to_string(),
            detected_at: Utc::now(),
        };

        let started = Instant::now();
        match self.store.apply_change(&self.pair, &event).await {
            Ok(()) => {
                self.ledger.remember(fp, Direction::SheetToDb);
                self.metrics
                    .record_success(Direction::SheetToDb, started.elapsed());
                self.health.record(true);
                self.failure_streaks.remove(external_id);
                outcome.applied += 1;

                if action == ChangeAction::Insert {
                    if let Some(key) = &key_value {
                        if let Err(e) = self
                            .store
                            .save_id_mapping(&self.pair.name, key, external_id)
                            .await
                        {
                            warn!(pair = %self.pair.name, error = %e, "Failed to save id mapping");
                        }
                    }
                }

                self.advance_snapshot(action, external_id, fp)
            }
            Err(e) => {
                let kind = e.failure_kind();
                self.health.record(false);
                self.metrics.record_failure(Direction::SheetToDb, kind);
                outcome.failed += 1;

                if kind.is_retryable() {
                    let streak = self.failure_streaks.entry(external_id.to_string()).or_insert(0);
                    *streak += 1;
                    if *streak <= self.retry_max {
                        // Snapshot stays put; the next tick retries.
                        debug!(
                            pair = %self.pair.name,
                            record = external_id,
                            attempt = *streak,
                            error = %e,
                            "Transient apply failure, will retry"
                        );
                        return false;
                    }
                    warn!(
                        pair = %self.pair.name,
                        record = external_id,
                        error = %e,
                        "Retry budget exhausted, giving up on record"
                    );
                    self.failure_streaks.remove(external_id);
                } else {
                    warn!(
                        pair = %self.pair.name,
                        record = external_id,
                        kind = kind.as_str(),
                        error = %e,
                        "Permanent apply failure"
                    );
                }

                let _ = self
                    .store
                    .record_sync(
                        &self.pair.db_table,
                        external_id,
                        Direction::SheetToDb,
                        fp,
                        "failed",
                        Some(&e.to_string()),
                    )
                    .await;
                self.advance_snapshot(action, external_id, fp)
            }
        }
    }

    fn advance_snapshot(&mut self, action: ChangeAction, external_id: &str, fp: &str) -> bool {
        match action {
            ChangeAction::Delete => {
                self.snapshot.remove(external_id);
            }
            _ => {
                self.snapshot.insert(external_id.to_string(), fp.to_string());
            }
        }
        true
    }

    fn persist_snapshot(&self) {
        if let Err(e) = self.snapshots.save(&self.pair.name, &self.snapshot) {
            warn!(pair = %self.pair.name, error = %e, "Failed to persist snapshot");
        }
    }

    /// Current snapshot size, for tests and debugging.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }
}

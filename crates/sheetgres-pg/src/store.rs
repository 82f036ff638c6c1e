use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::{Client, Transaction};
use tracing::{debug, info, warn};

use sheetgres_core::{ChangeAction, ChangeEvent, Direction, QueueRow, QueueStatus, TablePair};

use crate::error::{PgError, PgResult};
use crate::writer;

/// Queue occupancy by status, plus the age marker the watchdog alarms on.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// DB-side operations the engine depends on. Implemented by the Postgres
/// store and by an in-memory mock for engine tests.
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// Apply one Sheet-side change to the target table. The `sync_log`
    /// entry and the DML run in one transaction so the table's trigger sees
    /// the log row and suppresses the echo. Key misses on UPDATE degrade to
    /// INSERT; unique violations on INSERT degrade to a compensating
    /// UPDATE; DELETE of an absent row is a no-op.
    async fn apply_change(&self, pair: &TablePair, event: &ChangeEvent) -> PgResult<()>;

    /// L2 ledger probe: has a completed write with this fingerprint been
    /// logged in `direction` within `window`?
    async fn loop_recorded(
        &self,
        fingerprint: &str,
        direction: Direction,
        window: Duration,
    ) -> PgResult<bool>;

    /// Record an applied (or failed) write in `sync_log`.
    async fn record_sync(
        &self,
        table: &str,
        record_id: &str,
        direction: Direction,
        fingerprint: &str,
        status: &str,
        error: Option<&str>,
    ) -> PgResult<()>;

    /// Claim up to `batch_size` due pending rows, oldest first. Uses
    /// `FOR UPDATE SKIP LOCKED` so concurrent consumers never double-claim.
    async fn claim_pending(&self, batch_size: i64, retry_max: i32) -> PgResult<Vec<QueueRow>>;

    async fn mark_completed(&self, id: i64, reason: Option<&str>) -> PgResult<()>;

    /// Record a failure: back to `pending` with a retry deadline while the
    /// budget lasts, `failed` after. Returns the resulting status.
    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry_max: i32,
        next_attempt_in: Duration,
    ) -> PgResult<QueueStatus>;

    async fn save_id_mapping(&self, pair: &str, key_value: &str, external_id: &str)
        -> PgResult<()>;

    async fn external_id_for(&self, pair: &str, key_value: &str) -> PgResult<Option<String>>;

    async fn key_for(&self, pair: &str, external_id: &str) -> PgResult<Option<String>>;

    /// Queue occupancy by status. Feeds the depth gauge and the status
    /// report, and the watchdog's backlog alarm.
    async fn queue_stats(&self) -> PgResult<QueueStats>;

    /// Startup sweep: rows claimed by a previous run that never completed
    /// go back to `pending`.
    async fn recover_stale_claims(&self, stale_after: Duration) -> PgResult<u64>;

    /// Prune `sync_log` rows older than `retention`. Queue rows are never
    /// deleted by the engine.
    async fn cleanup_sync_log(&self, retention: Duration) -> PgResult<u64>;
}

/// PostgreSQL-backed sync store. Owns `sync_queue`, `sync_log`, and
/// `id_mapping`; the synced tables themselves belong to the operator.
pub struct PgSyncStore {
    client: Mutex<Client>,
}

impl PgSyncStore {
    /// Connect and make sure the engine's own tables exist.
    pub async fn connect(connection_string: &str) -> PgResult<Self> {
        let client = crate::connect::connect_postgres(connection_string).await?;
        let store = Self {
            client: Mutex::new(client),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn from_client(client: Client) -> PgResult<Self> {
        let store = Self {
            client: Mutex::new(client),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> PgResult<()> {
        debug!("Ensuring sync schema exists");
        let client = self.client.lock().await;

        client
            .batch_execute(
                r#"
                CREATE TABLE IF NOT EXISTS sync_queue (
                    id BIGSERIAL PRIMARY KEY,
                    table_name TEXT NOT NULL,
                    record_id TEXT NOT NULL,
                    action TEXT NOT NULL,
                    old_data JSONB,
                    new_data JSONB,
                    sync_hash CHAR(32),
                    sync_source TEXT DEFAULT 'database',
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    processed_at TIMESTAMPTZ,
                    next_attempt_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    status TEXT NOT NULL DEFAULT 'pending',
                    retry_count INT NOT NULL DEFAULT 0,
                    error_message TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_sync_queue_status_created
                    ON sync_queue (status, created_at);
                CREATE INDEX IF NOT EXISTS idx_sync_queue_table_record
                    ON sync_queue (table_name, record_id);

                CREATE TABLE IF NOT EXISTS sync_log (
                    id BIGSERIAL PRIMARY KEY,
                    sync_id TEXT UNIQUE,
                    table_name TEXT,
                    record_id TEXT,
                    direction TEXT,
                    sync_hash CHAR(32),
                    status TEXT,
                    error_message TEXT,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );
                CREATE INDEX IF NOT EXISTS idx_sync_log_hash ON sync_log (sync_hash);
                CREATE INDEX IF NOT EXISTS idx_sync_log_created ON sync_log (created_at);

                CREATE TABLE IF NOT EXISTS id_mapping (
                    pair TEXT NOT NULL,
                    key_value TEXT NOT NULL,
                    external_id TEXT NOT NULL,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (pair, key_value),
                    UNIQUE (pair, external_id)
                );
                "#,
            )
            .await
            .map_err(PgError::from)?;

        info!("Sync schema initialized");
        Ok(())
    }

    /// Cheap connectivity probe for the `test` command.
    pub async fn ping(&self) -> PgResult<()> {
        let client = self.client.lock().await;
        client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }

    /// Verify that each synced table has row triggers installed. Returns
    /// the tables that have none; the engine cannot see DB changes without
    /// them.
    pub async fn tables_missing_triggers(&self, tables: &[String]) -> PgResult<Vec<String>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT DISTINCT event_object_table
                FROM information_schema.triggers
                WHERE event_object_table = ANY($1)
                "#,
                &[&tables],
            )
            .await?;

        let with_triggers: Vec<String> = rows.into_iter().map(|r| r.get(0)).collect();
        Ok(tables
            .iter()
            .filter(|t| !with_triggers.contains(t))
            .cloned()
            .collect())
    }

    async fn record_sync_in_tx(
        tx: &Transaction<'_>,
        table: &str,
        record_id: &str,
        direction: Direction,
        fingerprint: &str,
        status: &str,
        error: Option<&str>,
    ) -> PgResult<()> {
        let sync_id = format!("{}_{}_{}", table, record_id, fingerprint);
        tx.execute(
            r#"
            INSERT INTO sync_log (sync_id, table_name, record_id, direction, sync_hash, status, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (sync_id)
            DO UPDATE SET status = $6, error_message = $7, created_at = NOW()
            "#,
            &[
                &sync_id,
                &table,
                &record_id,
                &direction.as_str(),
                &fingerprint,
                &status,
                &error,
            ],
        )
        .await?;
        Ok(())
    }

    async fn insert_with_log(
        &self,
        client: &mut Client,
        pair: &TablePair,
        event: &ChangeEvent,
    ) -> PgResult<()> {
        let row = event.row.as_ref().ok_or_else(|| PgError::InvalidQueueRow {
            id: 0,
            reason: "insert event without payload".into(),
        })?;

        let tx = client.transaction().await?;
        Self::record_sync_in_tx(
            &tx,
            &pair.db_table,
            &event.external_id,
            Direction::SheetToDb,
            &event.fingerprint,
            "completed",
            None,
        )
        .await?;
        writer::insert_row(&tx, pair, row).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_with_log(
        &self,
        client: &mut Client,
        pair: &TablePair,
        event: &ChangeEvent,
        key_value: &str,
    ) -> PgResult<u64> {
        let row = event.row.as_ref().ok_or_else(|| PgError::InvalidQueueRow {
            id: 0,
            reason: "update event without payload".into(),
        })?;

        let tx = client.transaction().await?;
        Self::record_sync_in_tx(
            &tx,
            &pair.db_table,
            &event.external_id,
            Direction::SheetToDb,
            &event.fingerprint,
            "completed",
            None,
        )
        .await?;
        let affected = writer::update_row(&tx, pair, row, key_value).await?;
        tx.commit().await?;
        Ok(affected)
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn apply_change(&self, pair: &TablePair, event: &ChangeEvent) -> PgResult<()> {
        let mut client = self.client.lock().await;
        let key_value = event.key_value.clone().unwrap_or_default();

        match event.action {
            ChangeAction::Insert => {
                match self.insert_with_log(&mut client, pair, event).await {
                    Err(PgError::UniqueViolation(detail)) => {
                        // The row already exists (e.g. resync after a
                        // snapshot reset). Compensate with an update.
                        warn!(
                            pair = %pair.name,
                            key = %key_value,
                            detail = %detail,
                            "Insert conflicted, applying compensating update"
                        );
                        self.update_with_log(&mut client, pair, event, &key_value)
                            .await?;
                        Ok(())
                    }
                    other => other,
                }
            }
            ChangeAction::Update => {
                let affected = self
                    .update_with_log(&mut client, pair, event, &key_value)
                    .await?;
                if affected == 0 {
                    debug!(
                        pair = %pair.name,
                        key = %key_value,
                        "Update matched no row, degrading to insert"
                    );
                    self.insert_with_log(&mut client, pair, event).await?;
                }
                Ok(())
            }
            ChangeAction::Delete => {
                let tx = client.transaction().await?;
                Self::record_sync_in_tx(
                    &tx,
                    &pair.db_table,
                    &event.external_id,
                    Direction::SheetToDb,
                    &event.fingerprint,
                    "completed",
                    None,
                )
                .await?;
                let affected = writer::delete_row(&tx, pair, &key_value).await?;
                tx.commit().await?;
                if affected == 0 {
                    debug!(pair = %pair.name, key = %key_value, "Delete matched no row");
                }
                Ok(())
            }
        }
    }

    async fn loop_recorded(
        &self,
        fingerprint: &str,
        direction: Direction,
        window: Duration,
    ) -> PgResult<bool> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM sync_log
                    WHERE sync_hash = $1
                      AND direction = $2
                      AND status = 'completed'
                      AND created_at > NOW() - make_interval(secs => $3)
                )
                "#,
                &[&fingerprint, &direction.as_str(), &window.as_secs_f64()],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn record_sync(
        &self,
        table: &str,
        record_id: &str,
        direction: Direction,
        fingerprint: &str,
        status: &str,
        error: Option<&str>,
    ) -> PgResult<()> {
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;
        Self::record_sync_in_tx(&tx, table, record_id, direction, fingerprint, status, error)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn claim_pending(&self, batch_size: i64, retry_max: i32) -> PgResult<Vec<QueueRow>> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                r#"
                UPDATE sync_queue
                SET status = 'processing', processed_at = NOW()
                WHERE id IN (
                    SELECT id FROM sync_queue
                    WHERE status = 'pending'
                      AND retry_count < $2
                      AND next_attempt_at <= NOW()
                    ORDER BY created_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                RETURNING id, table_name, record_id, action, old_data, new_data,
                          sync_hash, retry_count, created_at
                "#,
                &[&batch_size, &retry_max],
            )
            .await?;

        rows.into_iter()
            .map(|r| {
                let id: i64 = r.get(0);
                let action_raw: String = r.get(3);
                let action = ChangeAction::parse(&action_raw).ok_or_else(|| {
                    PgError::InvalidQueueRow {
                        id,
                        reason: format!("unknown action '{}'", action_raw),
                    }
                })?;
                let sync_hash: Option<String> = r.get(6);

                Ok(QueueRow {
                    id,
                    table_name: r.get(1),
                    record_id: r.get(2),
                    action,
                    old_row: r.get(4),
                    new_row: r.get(5),
                    sync_hash: sync_hash.map(|h| h.trim().to_string()),
                    retry_count: r.get(7),
                    created_at: r.get(8),
                })
            })
            .collect()
    }

    async fn mark_completed(&self, id: i64, reason: Option<&str>) -> PgResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                r#"
                UPDATE sync_queue
                SET status = 'completed', processed_at = NOW(), error_message = $2
                WHERE id = $1
                "#,
                &[&id, &reason],
            )
            .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry_max: i32,
        next_attempt_in: Duration,
    ) -> PgResult<QueueStatus> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                r#"
                UPDATE sync_queue
                SET retry_count = retry_count + 1,
                    error_message = $2,
                    status = CASE WHEN retry_count + 1 >= $3 THEN 'failed' ELSE 'pending' END,
                    next_attempt_at = NOW() + make_interval(secs => $4),
                    processed_at = NOW()
                WHERE id = $1
                RETURNING status
                "#,
                &[&id, &error, &retry_max, &next_attempt_in.as_secs_f64()],
            )
            .await?;

        let status: String = row.get(0);
        Ok(if status == "failed" {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        })
    }

    async fn save_id_mapping(
        &self,
        pair: &str,
        key_value: &str,
        external_id: &str,
    ) -> PgResult<()> {
        let client = self.client.lock().await;
        client
            .execute(
                r#"
                INSERT INTO id_mapping (pair, key_value, external_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (pair, key_value)
                DO UPDATE SET external_id = $3, updated_at = NOW()
                "#,
                &[&pair, &key_value, &external_id],
            )
            .await?;
        Ok(())
    }

    async fn external_id_for(&self, pair: &str, key_value: &str) -> PgResult<Option<String>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT external_id FROM id_mapping WHERE pair = $1 AND key_value = $2",
                &[&pair, &key_value],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn key_for(&self, pair: &str, external_id: &str) -> PgResult<Option<String>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                "SELECT key_value FROM id_mapping WHERE pair = $1 AND external_id = $2",
                &[&pair, &external_id],
            )
            .await?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn queue_stats(&self) -> PgResult<QueueStats> {
        let client = self.client.lock().await;
        let rows = client
            .query(
                r#"
                SELECT status, COUNT(*), MIN(created_at)
                FROM sync_queue
                GROUP BY status
                "#,
                &[],
            )
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            let oldest: Option<DateTime<Utc>> = row.get(2);
            match status.as_str() {
                "pending" => {
                    stats.pending = count;
                    stats.oldest_pending = oldest;
                }
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn recover_stale_claims(&self, stale_after: Duration) -> PgResult<u64> {
        let client = self.client.lock().await;
        let count = client
            .execute(
                r#"
                UPDATE sync_queue
                SET status = 'pending'
                WHERE status = 'processing'
                  AND processed_at < NOW() - make_interval(secs => $1)
                "#,
                &[&stale_after.as_secs_f64()],
            )
            .await?;

        if count > 0 {
            info!(count, "Recovered stale queue claims");
        }
        Ok(count)
    }

    async fn cleanup_sync_log(&self, retention: Duration) -> PgResult<u64> {
        let client = self.client.lock().await;
        let count = client
            .execute(
                "DELETE FROM sync_log WHERE created_at < NOW() - make_interval(secs => $1)",
                &[&retention.as_secs_f64()],
            )
            .await?;

        if count > 0 {
            info!(count, "Pruned old sync_log rows");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats_default_and_total() {
        let stats = QueueStats::default();
        assert_eq!(stats.total(), 0);
        assert!(stats.oldest_pending.is_none());

        let stats = QueueStats {
            pending: 3,
            processing: 1,
            completed: 10,
            failed: 2,
            oldest_pending: None,
        };
        assert_eq!(stats.total(), 16);
    }
}

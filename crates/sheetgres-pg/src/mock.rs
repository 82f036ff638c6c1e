use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use sheetgres_core::{ChangeAction, ChangeEvent, Direction, QueueRow, QueueStatus, TablePair};

use crate::error::{PgError, PgResult};
use crate::store::{QueueStats, SyncStore};

/// In-memory sync store for engine tests: a queue, a sync log, and the id
/// mapping, with failure injection for the apply path.
#[derive(Clone, Default)]
pub struct MockSyncStore {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    queue: Vec<MockQueueRow>,
    log: Vec<LogEntry>,
    mapping: HashMap<(String, String), String>,
    /// Changes applied to the "DB", in order.
    applied: Vec<(String, ChangeEvent)>,
    /// If set, `apply_change` fails with a connection error.
    fail_apply: Option<String>,
    next_id: i64,
}

struct MockQueueRow {
    row: QueueRow,
    status: QueueStatus,
    next_attempt: Instant,
    reason: Option<String>,
    error: Option<String>,
}

struct LogEntry {
    fingerprint: String,
    direction: Direction,
    status: String,
    at: Instant,
}

impl MockSyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a pending row as the DB trigger would. Returns its id.
    pub fn push_pending(
        &self,
        table: &str,
        record_id: &str,
        action: ChangeAction,
        old_row: Option<serde_json::Value>,
        new_row: Option<serde_json::Value>,
        sync_hash: Option<&str>,
    ) -> i64 {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = state.next_id;
        state.queue.push(MockQueueRow {
            row: QueueRow {
                id,
                table_name: table.to_string(),
                record_id: record_id.to_string(),
                action,
                old_row,
                new_row,
                sync_hash: sync_hash.map(String::from),
                retry_count: 0,
                created_at: Utc::now(),
            },
            status: QueueStatus::Pending,
            next_attempt: Instant::now(),
            reason: None,
            error: None,
        });
        id
    }

    pub fn row_status(&self, id: i64) -> Option<(QueueStatus, i32, Option<String>)> {
        let state = self.state.lock().unwrap();
        state
            .queue
            .iter()
            .find(|r| r.row.id == id)
            .map(|r| (r.status, r.row.retry_count, r.reason.clone()))
    }

    /// Changes the poller applied, in order.
    pub fn applied(&self) -> Vec<(String, ChangeEvent)> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn fail_apply_with(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_apply = Some(message.into());
    }

    pub fn clear_fail_apply(&self) {
        self.state.lock().unwrap().fail_apply = None;
    }

    pub fn seed_mapping(&self, pair: &str, key_value: &str, external_id: &str) {
        self.state.lock().unwrap().mapping.insert(
            (pair.to_string(), key_value.to_string()),
            external_id.to_string(),
        );
    }

    pub fn log_len(&self) -> usize {
        self.state.lock().unwrap().log.len()
    }
}

#[async_trait]
impl SyncStore for MockSyncStore {
    async fn apply_change(&self, pair: &TablePair, event: &ChangeEvent) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(ref message) = state.fail_apply {
            return Err(PgError::Connection(message.clone()));
        }

        let fingerprint = event.fingerprint.clone();
        state.applied.push((pair.name.clone(), event.clone()));
        state.log.push(LogEntry {
            fingerprint,
            direction: Direction::SheetToDb,
            status: "completed".into(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn loop_recorded(
        &self,
        fingerprint: &str,
        direction: Direction,
        window: Duration,
    ) -> PgResult<bool> {
        let state = self.state.lock().unwrap();
        let now = Instant::now();
        Ok(state.log.iter().any(|entry| {
            entry.fingerprint == fingerprint
                && entry.direction == direction
                && entry.status == "completed"
                && now.duration_since(entry.at) < window
        }))
    }

    async fn record_sync(
        &self,
        _table: &str,
        _record_id: &str,
        direction: Direction,
        fingerprint: &str,
        status: &str,
        _error: Option<&str>,
    ) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        state.log.push(LogEntry {
            fingerprint: fingerprint.to_string(),
            direction,
            status: status.to_string(),
            at: Instant::now(),
        });
        Ok(())
    }

    async fn claim_pending(&self, batch_size: i64, retry_max: i32) -> PgResult<Vec<QueueRow>> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        let mut due: Vec<usize> = state
            .queue
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                r.status == QueueStatus::Pending
                    && r.row.retry_count < retry_max
                    && r.next_attempt <= now
            })
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| state.queue[i].row.created_at);
        due.truncate(batch_size as usize);

        let mut claimed = Vec::new();
        for index in due {
            state.queue[index].status = QueueStatus::Processing;
            claimed.push(state.queue[index].row.clone());
        }
        Ok(claimed)
    }

    async fn mark_completed(&self, id: i64, reason: Option<&str>) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.queue.iter_mut().find(|r| r.row.id == id) {
            row.status = QueueStatus::Completed;
            row.reason = reason.map(String::from);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: i64,
        error: &str,
        retry_max: i32,
        next_attempt_in: Duration,
    ) -> PgResult<QueueStatus> {
        let mut state = self.state.lock().unwrap();
        let row = state
            .queue
            .iter_mut()
            .find(|r| r.row.id == id)
            .ok_or(PgError::RowNotFound(id.to_string()))?;

        row.row.retry_count += 1;
        row.error = Some(error.to_string());
        row.next_attempt = Instant::now() + next_attempt_in;
        row.status = if row.row.retry_count >= retry_max {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };
        Ok(row.status)
    }

    async fn save_id_mapping(
        &self,
        pair: &str,
        key_value: &str,
        external_id: &str,
    ) -> PgResult<()> {
        self.seed_mapping(pair, key_value, external_id);
        Ok(())
    }

    async fn external_id_for(&self, pair: &str, key_value: &str) -> PgResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .mapping
            .get(&(pair.to_string(), key_value.to_string()))
            .cloned())
    }

    async fn key_for(&self, pair: &str, external_id: &str) -> PgResult<Option<String>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .mapping
            .iter()
            .find(|((p, _), ext)| p == pair && ext.as_str() == external_id)
            .map(|((_, key), _)| key.clone()))
    }

    async fn queue_stats(&self) -> PgResult<QueueStats> {
        let state = self.state.lock().unwrap();
        let mut stats = QueueStats::default();
        for row in &state.queue {
            match row.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn recover_stale_claims(&self, _stale_after: Duration) -> PgResult<u64> {
        let mut state = self.state.lock().unwrap();
        let mut recovered = 0;
        for row in &mut state.queue {
            if row.status == QueueStatus::Processing {
                row.status = QueueStatus::Pending;
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn cleanup_sync_log(&self, retention: Duration) -> PgResult<u64> {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let before = state.log.len();
        state
            .log
            .retain(|entry| now.duration_since(entry.at) < retention);
        Ok((before - state.log.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_marks_processing_and_orders() {
        let store = MockSyncStore::new();
        let first = store.push_pending("users", "k1", ChangeAction::Insert, None, None, None);
        let second = store.push_pending("users", "k2", ChangeAction::Insert, None, None, None);

        let claimed = store.claim_pending(10, 3).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(claimed[0].id, first);
        assert_eq!(claimed[1].id, second);

        // Nothing left to claim.
        assert!(store.claim_pending(10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failed_respects_retry_budget() {
        let store = MockSyncStore::new();
        let id = store.push_pending("users", "k1", ChangeAction::Insert, None, None, None);

        let status = store
            .mark_failed(id, "boom", 2, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(status, QueueStatus::Pending);

        let status = store
            .mark_failed(id, "boom", 2, Duration::from_secs(0))
            .await
            .unwrap();
        assert_eq!(status, QueueStatus::Failed);
    }

    #[tokio::test]
    async fn test_loop_recorded_window() {
        let store = MockSyncStore::new();
        store
            .record_sync("users", "k1", Direction::DbToSheet, "fp1", "completed", None)
            .await
            .unwrap();

        assert!(store
            .loop_recorded("fp1", Direction::DbToSheet, Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .loop_recorded("fp1", Direction::SheetToDb, Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .loop_recorded("fp2", Direction::DbToSheet, Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_id_mapping_roundtrip() {
        let store = MockSyncStore::new();
        store.save_id_mapping("MyDB:users", "k1", "rec9").await.unwrap();

        assert_eq!(
            store.external_id_for("MyDB:users", "k1").await.unwrap(),
            Some("rec9".to_string())
        );
        assert_eq!(
            store.key_for("MyDB:users", "rec9").await.unwrap(),
            Some("k1".to_string())
        );
        assert_eq!(store.key_for("MyDB:users", "other").await.unwrap(), None);
    }
}

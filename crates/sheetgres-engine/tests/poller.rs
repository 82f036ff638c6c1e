use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use sheetgres_core::{
    fingerprint, sheet_to_db, ChangeAction, Direction, FieldMap, Ledger, TablePair,
};
use sheetgres_engine::{Metrics, PairHealth, Poller, SnapshotStore};
use sheetgres_pg::{MockSyncStore, SyncStore};
use sheetgres_sheet::{MockSheetClient, RateLimiter};

fn users_pair() -> TablePair {
    TablePair::builder("MyDB", "users")
        .db_table("users")
        .key_field("user_key")
        .poll_interval(Duration::from_secs(5))
        .field_map(
            FieldMap::new(vec![
                ("Name".into(), "name".into()),
                ("Age".into(), "age".into()),
                ("Key".into(), "user_key".into()),
            ])
            .unwrap(),
        )
        .build()
        .unwrap()
}

struct Harness {
    client: MockSheetClient,
    store: Arc<MockSyncStore>,
    ledger: Arc<Ledger>,
    metrics: Arc<Metrics>,
    snapshots: Arc<SnapshotStore>,
    _dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            client: MockSheetClient::new(),
            store: Arc::new(MockSyncStore::new()),
            ledger: Arc::new(Ledger::new(Duration::from_secs(10), 10_000).unwrap()),
            metrics: Arc::new(Metrics::new()),
            snapshots: Arc::new(SnapshotStore::new(dir.path())),
            _dir: dir,
        }
    }

    fn poller(&self) -> Poller<MockSheetClient, MockSyncStore> {
        Poller::new(
            users_pair(),
            Arc::new(self.client.clone()),
            self.store.clone(),
            self.ledger.clone(),
            Arc::new(RateLimiter::new(1000.0)),
            self.metrics.clone(),
            self.snapshots.clone(),
            Arc::new(PairHealth::new(Duration::from_secs(300))),
            3,
        )
    }
}

fn fields(json: serde_json::Value) -> HashMap<String, serde_json::Value> {
    json.as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn mapped_fingerprint(json: serde_json::Value) -> String {
    let (_, row) = sheet_to_db(&users_pair(), &fields(json)).unwrap();
    fingerprint(&row)
}

#[tokio::test]
async fn cold_start_seeds_snapshot_without_writes() {
    let harness = Harness::new();
    harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    let outcome = poller.poll_once().await.unwrap();

    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.applied, 0);
    assert!(harness.store.applied().is_empty());
    assert_eq!(harness.metrics.skip_total("cold_start_identical"), 1);
    assert_eq!(poller.snapshot_len(), 1);

    // Identical content on the next poll is a no-op.
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied + outcome.skipped + outcome.failed, 0);
}

#[tokio::test]
async fn sheet_edit_becomes_db_update() {
    let harness = Harness::new();
    let id = harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    harness.client.edit_record(
        "MyDB",
        "users",
        &id,
        fields(serde_json::json!({"Name": "a", "Age": 2, "Key": "k1"})),
    );

    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied, 1);

    let applied = harness.store.applied();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].1.action, ChangeAction::Update);
    assert_eq!(applied[0].1.key_value.as_deref(), Some("k1"));
    assert_eq!(harness.metrics.success_total(Direction::SheetToDb), 1);

    // Echo suppressed afterwards: the ledger remembers the write.
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied, 0);
}

#[tokio::test]
async fn consumer_echo_is_suppressed_by_ledger() {
    let harness = Harness::new();
    let id = harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    // The queue consumer writes age=3 to the Sheet and remembers it.
    let new_fields = serde_json::json!({"Name": "a", "Age": 3, "Key": "k1"});
    harness.client.edit_record("MyDB", "users", &id, fields(new_fields.clone()));
    harness
        .ledger
        .remember(&mapped_fingerprint(new_fields), Direction::DbToSheet);

    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.skipped, 1);
    assert!(harness.store.applied().is_empty());
    assert_eq!(harness.metrics.skip_total("loop"), 1);

    // Snapshot advanced anyway: the next poll is quiet.
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.skipped, 0);
}

#[tokio::test]
async fn consumer_echo_is_suppressed_by_sync_log() {
    let harness = Harness::new();
    let id = harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    // Same echo, but only the durable tier knows about it (e.g. the write
    // happened before a restart wiped the in-memory ledger).
    let new_fields = serde_json::json!({"Name": "a", "Age": 3, "Key": "k1"});
    harness.client.edit_record("MyDB", "users", &id, fields(new_fields.clone()));
    harness
        .store
        .record_sync(
            "users",
            "k1",
            Direction::DbToSheet,
            &mapped_fingerprint(new_fields),
            "completed",
            None,
        )
        .await
        .unwrap();

    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.skipped, 1);
}

#[tokio::test]
async fn deleted_record_deletes_db_row() {
    let harness = Harness::new();
    let id = harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );
    harness.store.seed_mapping("MyDB:users", "k1", &id);

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    harness.client.remove_record("MyDB", "users", &id);
    let outcome = poller.poll_once().await.unwrap();

    assert_eq!(outcome.applied, 1);
    let applied = harness.store.applied();
    assert_eq!(applied[0].1.action, ChangeAction::Delete);
    assert_eq!(applied[0].1.key_value.as_deref(), Some("k1"));
    assert_eq!(poller.snapshot_len(), 0);
}

#[tokio::test]
async fn delete_without_mapping_is_already_absent() {
    let harness = Harness::new();
    let id = harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    harness.client.remove_record("MyDB", "users", &id);
    let outcome = poller.poll_once().await.unwrap();

    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.skipped, 1);
    assert!(harness.store.applied().is_empty());
    assert_eq!(harness.metrics.skip_total("already_absent"), 1);
}

#[tokio::test]
async fn transient_failure_retries_next_tick() {
    let harness = Harness::new();
    let id = harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    harness.client.edit_record(
        "MyDB",
        "users",
        &id,
        fields(serde_json::json!({"Name": "a", "Age": 2, "Key": "k1"})),
    );
    harness.store.fail_apply_with("connection reset");

    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert!(harness.store.applied().is_empty());

    // Snapshot did not advance, so the change is retried and now lands.
    harness.store.clear_fail_apply();
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied, 1);
}

#[tokio::test]
async fn unmappable_new_record_fails_once() {
    let harness = Harness::new();
    harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    // A record with no key field cannot be mapped.
    harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "broken"})),
    );

    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.failed, 1);
    assert!(harness.store.applied().is_empty());

    // The snapshot advanced, so it is not re-reported every tick.
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.failed, 0);
}

#[tokio::test]
async fn pagination_reads_to_exhaustion() {
    let harness = Harness::new();
    harness.client.set_page_size(2);
    for i in 0..5 {
        harness.client.seed_record(
            "MyDB",
            "users",
            fields(serde_json::json!({"Name": "n", "Age": i, "Key": format!("k{}", i)})),
        );
    }

    let mut poller = harness.poller();
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.skipped, 5);
    assert_eq!(poller.snapshot_len(), 5);
}

#[tokio::test]
async fn reset_snapshot_forces_full_resync() {
    let harness = Harness::new();
    for i in 0..2 {
        harness.client.seed_record(
            "MyDB",
            "users",
            fields(serde_json::json!({"Name": "n", "Age": i, "Key": format!("k{}", i)})),
        );
    }

    // First run initializes and persists.
    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();
    assert!(harness.store.applied().is_empty());

    // Operator resets the pair; a fresh poller (as after a restart) now
    // replays every Sheet row as a create.
    harness.snapshots.reset("MyDB:users").unwrap();
    let mut poller = harness.poller();
    let outcome = poller.poll_once().await.unwrap();

    assert_eq!(outcome.applied, 2);
    let applied = harness.store.applied();
    assert!(applied.iter().all(|(_, e)| e.action == ChangeAction::Insert));
}

#[tokio::test]
async fn snapshot_persists_across_pollers() {
    let harness = Harness::new();
    harness.client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );

    let mut poller = harness.poller();
    poller.poll_once().await.unwrap();

    // A new poller (restart) loads the persisted snapshot and stays quiet.
    let mut poller = harness.poller();
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied + outcome.skipped + outcome.failed, 0);
}

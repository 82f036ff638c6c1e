//! Both pipelines against the same ledger: concurrent edits on the two
//! sides each apply exactly once and the system settles with no echo loop.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use sheetgres_core::{
    BackoffPolicy, ChangeAction, Direction, FieldMap, Ledger, QueueStatus, TablePair,
};
use sheetgres_engine::{Consumer, Metrics, PairHealth, Poller, SnapshotStore};
use sheetgres_pg::MockSyncStore;
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

fn fields(json: serde_json::Value) -> HashMap<String, serde_json::Value> {
    json.as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[tokio::test]
async fn concurrent_edits_converge_without_looping() {
    let dir = TempDir::new().unwrap();
    let client = MockSheetClient::new();
    let store = Arc::new(MockSyncStore::new());
    let ledger = Arc::new(Ledger::new(Duration::from_secs(10), 10_000).unwrap());
    let metrics = Arc::new(Metrics::new());
    let limiter = Arc::new(RateLimiter::new(1000.0));
    let snapshots = Arc::new(SnapshotStore::new(dir.path()));

    let pair = users_pair();
    let health: HashMap<String, Arc<PairHealth>> = [(
        pair.db_table.clone(),
        Arc::new(PairHealth::new(Duration::from_secs(300))),
    )]
    .into_iter()
    .collect();

    let mut poller = Poller::new(
        pair.clone(),
        Arc::new(client.clone()),
        store.clone(),
        ledger.clone(),
        limiter.clone(),
        metrics.clone(),
        snapshots.clone(),
        Arc::new(PairHealth::new(Duration::from_secs(300))),
        3,
    );
    let consumer = Consumer::new(
        &[pair.clone()],
        Arc::new(client.clone()),
        store.clone(),
        ledger.clone(),
        limiter,
        metrics.clone(),
        health,
        Arc::new(AtomicI64::new(10)),
        3,
        BackoffPolicy::new(Duration::ZERO, Duration::ZERO),
    );

    // Both sides start in agreement on age=1.
    let external_id = client.seed_record(
        "MyDB",
        "users",
        fields(serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"})),
    );
    store.seed_mapping("MyDB:users", "k1", &external_id);
    poller.poll_once().await.unwrap();

    // A user edits the Sheet to age=4 while an application write sets the
    // DB row to age=5; the trigger has already enqueued the DB change.
    client.edit_record(
        "MyDB",
        "users",
        &external_id,
        fields(serde_json::json!({"Name": "a", "Age": 4, "Key": "k1"})),
    );
    let queue_id = store.push_pending(
        "users",
        "k1",
        ChangeAction::Update,
        None,
        Some(serde_json::json!({"name": "a", "age": 5, "user_key": "k1"})),
        None,
    );

    // Both directions run. The fingerprints differ, so neither write is
    // suppressed: last writer wins.
    poller.poll_once().await.unwrap();
    consumer.drain_once().await.unwrap();

    assert_eq!(metrics.success_total(Direction::SheetToDb), 1);
    assert_eq!(metrics.success_total(Direction::DbToSheet), 1);
    assert_eq!(
        store.row_status(queue_id).unwrap().0,
        QueueStatus::Completed
    );

    // The Sheet now carries the consumer's write (age=5). The next poll
    // recognizes it as the engine's own echo and applies nothing.
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.skipped, 1);

    // And after that the system is fully settled.
    let outcome = poller.poll_once().await.unwrap();
    assert_eq!(outcome.applied + outcome.skipped + outcome.failed, 0);
    assert_eq!(store.applied().len(), 1);
    assert_eq!(client.records("MyDB", "users").len(), 1);
    assert_eq!(
        client.records("MyDB", "users")[0].fields.get("Age"),
        Some(&serde_json::json!(5))
    );
}

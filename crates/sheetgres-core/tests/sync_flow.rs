//! Scenario tests for the pure sync pipeline: map → fingerprint → diff →
//! ledger, without any I/O.

use std::collections::HashMap;
use std::time::Duration;

use sheetgres_core::{
    diff, fingerprint, sheet_to_db, ChangeAction, Direction, FieldMap, Ledger, Snapshot,
    TablePair,
};

struct Scenario {
    name: &'static str,
    snapshot: Vec<(&'static str, serde_json::Value)>,
    current: Vec<(&'static str, serde_json::Value)>,
    expected: Vec<(ChangeAction, &'static str)>,
}

fn users_pair() -> TablePair {
    TablePair::builder("MyDB", "users")
        .db_table("users")
        .key_field("user_key")
        .poll_interval(Duration::from_secs(5))
        .field_map(
            FieldMap::new(vec![
                ("Name".into(), "name".into()),
                ("Age".into(), "age".into()),
                ("Tags".into(), "tags".into()),
                ("Key".into(), "user_key".into()),
            ])
            .unwrap()
            .with_multi_select(vec!["tags".into()]),
        )
        .build()
        .unwrap()
}

fn record_fingerprint(pair: &TablePair, fields: &serde_json::Value) -> String {
    let fields: HashMap<String, serde_json::Value> = fields
        .as_object()
        .unwrap()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let (_, row) = sheet_to_db(pair, &fields).unwrap();
    fingerprint(&row)
}

#[test]
fn diff_scenarios() {
    let scenarios = vec![
        Scenario {
            name: "empty snapshot reports all creates",
            snapshot: vec![],
            current: vec![
                ("r1", serde_json::json!({"Name": "a", "Key": "k1"})),
                ("r2", serde_json::json!({"Name": "b", "Key": "k2"})),
            ],
            expected: vec![(ChangeAction::Insert, "r1"), (ChangeAction::Insert, "r2")],
        },
        Scenario {
            name: "unchanged content is quiet",
            snapshot: vec![("r1", serde_json::json!({"Name": "a", "Key": "k1"}))],
            current: vec![("r1", serde_json::json!({"Name": "a", "Key": "k1"}))],
            expected: vec![],
        },
        Scenario {
            name: "edit is an update, vanished row a trailing delete",
            snapshot: vec![
                ("r1", serde_json::json!({"Name": "a", "Key": "k1"})),
                ("r2", serde_json::json!({"Name": "b", "Key": "k2"})),
            ],
            current: vec![("r1", serde_json::json!({"Name": "a2", "Key": "k1"}))],
            expected: vec![(ChangeAction::Update, "r1"), (ChangeAction::Delete, "r2")],
        },
        Scenario {
            name: "multi-select order does not count as an edit",
            snapshot: vec![(
                "r1",
                serde_json::json!({"Name": "a", "Key": "k1", "Tags": ["x", "y"]}),
            )],
            current: vec![(
                "r1",
                serde_json::json!({"Name": "a", "Key": "k1", "Tags": ["y", "x"]}),
            )],
            expected: vec![],
        },
        Scenario {
            name: "whitespace-only change does not count as an edit",
            snapshot: vec![("r1", serde_json::json!({"Name": "a", "Key": "k1"}))],
            current: vec![("r1", serde_json::json!({"Name": " a ", "Key": "k1"}))],
            expected: vec![],
        },
    ];

    let pair = users_pair();
    for scenario in scenarios {
        let snapshot = Snapshot::from_entries(
            scenario
                .snapshot
                .iter()
                .map(|(id, fields)| (id.to_string(), record_fingerprint(&pair, fields)))
                .collect(),
        );
        let current: Vec<(String, String)> = scenario
            .current
            .iter()
            .map(|(id, fields)| (id.to_string(), record_fingerprint(&pair, fields)))
            .collect();

        let changes = diff(&current, &snapshot);
        let got: Vec<(ChangeAction, &str)> = changes
            .iter()
            .map(|(action, id)| (*action, id.as_str()))
            .collect();
        assert_eq!(got, scenario.expected, "scenario: {}", scenario.name);
    }
}

#[test]
fn ledger_suppresses_each_direction_once() {
    let pair = users_pair();
    let ledger = Ledger::new(Duration::from_secs(10), 1_000).unwrap();

    let content = serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"});
    let fp = record_fingerprint(&pair, &content);

    // The engine applies a Sheet edit to the DB...
    ledger.remember(&fp, Direction::SheetToDb);

    // ...so the queue consumer must skip the trigger's echo of it,
    assert!(ledger.should_skip(&fp, Direction::SheetToDb));
    // ...while the poller has no reason to skip the same content.
    assert!(!ledger.should_skip(&fp, Direction::DbToSheet));

    // Different content is never suppressed.
    let other = record_fingerprint(&pair, &serde_json::json!({"Name": "a", "Age": 2, "Key": "k1"}));
    assert!(!ledger.should_skip(&other, Direction::SheetToDb));
}

#[test]
fn reapplying_identical_content_is_observationally_idempotent() {
    let pair = users_pair();
    let content = serde_json::json!({"Name": "a", "Age": 1, "Key": "k1"});
    let fp = record_fingerprint(&pair, &content);

    // Inside the window the ledger suppresses; outside it, the diff does:
    // identical content carries an identical fingerprint, so a second
    // application produces no change event at all.
    let mut snapshot = Snapshot::new();
    snapshot.insert("r1", fp.clone());

    let current = vec![("r1".to_string(), fp)];
    assert!(diff(&current, &snapshot).is_empty());
}

use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};

/// A field value from either side of the sync, normalized to the engine's
/// type system. Conversion from the wire formats is explicit; values the
/// engine does not model (nested objects, attachments) are stringified
/// deterministically at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    /// Multi-select style list. Always sorted and deduplicated by the mapper.
    List(Vec<String>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render a scalar as an external key string. Lists, timestamps and
    /// nulls are not usable as record keys.
    pub fn as_key(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Int(i) => Some(i.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Convert a JSON value from either wire format. Strings that parse as
    /// timestamps become `Timestamp`; arrays of strings become `List`;
    /// anything the engine does not model is stringified with sorted keys
    /// so the result is deterministic.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => match parse_timestamp(s) {
                Some(ts) => Value::Timestamp(ts),
                None => Value::String(s.clone()),
            },
            serde_json::Value::Array(arr) => {
                if arr.iter().all(|item| item.is_string()) {
                    Value::List(
                        arr.iter()
                            .filter_map(|item| item.as_str().map(String::from))
                            .collect(),
                    )
                } else {
                    // Mixed or nested arrays fall back to canonical JSON text.
                    Value::String(v.to_string())
                }
            }
            serde_json::Value::Object(_) => Value::String(v.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Timestamp(ts) => serde_json::Value::String(
                ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ),
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .collect(),
            ),
        }
    }
}

/// Try the timestamp renderings both sides produce: RFC3339 (with or
/// without offset) and the bare `YYYY-MM-DD HH:MM:SS` form.
fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let bytes = s.as_bytes();
    if bytes.len() < 19 || !bytes[..4].iter().all(|b| b.is_ascii_digit()) || bytes[4] != b'-' {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

/// A record keyed by DB column names.
pub type RowMap = HashMap<String, Value>;

/// The kind of change detected on either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    /// The wire form used by the DB triggers in `sync_queue.action`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Insert => "INSERT",
            ChangeAction::Update => "UPDATE",
            ChangeAction::Delete => "DELETE",
        }
    }

    pub fn parse(s: &str) -> Option<ChangeAction> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeAction::Insert),
            "UPDATE" => Some(ChangeAction::Update),
            "DELETE" => Some(ChangeAction::Delete),
            _ => None,
        }
    }
}

/// Which way a write travelled through the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    SheetToDb,
    DbToSheet,
}

impl Direction {
    /// The wire form stored in `sync_log.direction`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::SheetToDb => "sheet_to_db",
            Direction::DbToSheet => "db_to_sheet",
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::SheetToDb => Direction::DbToSheet,
            Direction::DbToSheet => Direction::SheetToDb,
        }
    }
}

/// Queue row lifecycle. `Failed` is terminal once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

/// A change detected by the Sheet-side poller.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    /// The Sheet's record identifier.
    pub external_id: String,
    /// The DB-side key value, when the record could be mapped.
    pub key_value: Option<String>,
    /// The mapped payload. Absent for deletes.
    pub row: Option<RowMap>,
    pub fingerprint: String,
    pub detected_at: DateTime<Utc>,
}

/// A pending change claimed from `sync_queue`.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub id: i64,
    pub table_name: String,
    pub record_id: String,
    pub action: ChangeAction,
    pub old_row: Option<serde_json::Value>,
    pub new_row: Option<serde_json::Value>,
    /// Hash computed by the trigger. Advisory only; the consumer always
    /// recomputes from the mapped payload.
    pub sync_hash: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

impl QueueRow {
    /// The payload relevant to this row's action: new data for
    /// insert/update, old data for delete.
    pub fn payload(&self) -> Option<&serde_json::Value> {
        match self.action {
            ChangeAction::Insert | ChangeAction::Update => self.new_row.as_ref(),
            ChangeAction::Delete => self.old_row.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_accessors() {
        assert!(Value::Null.is_null());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert_eq!(Value::Int(42).as_i64(), Some(42));
        assert_eq!(Value::Int(42).as_f64(), Some(42.0));
        assert_eq!(Value::String("hi".into()).as_str(), Some("hi"));
    }

    #[test]
    fn test_value_as_key() {
        assert_eq!(Value::String("k1".into()).as_key(), Some("k1".into()));
        assert_eq!(Value::Int(7).as_key(), Some("7".into()));
        assert_eq!(Value::Null.as_key(), None);
        assert_eq!(Value::List(vec!["a".into()]).as_key(), None);
    }

    #[test]
    fn test_from_json_scalars() {
        assert_eq!(Value::from_json(&serde_json::json!(null)), Value::Null);
        assert_eq!(Value::from_json(&serde_json::json!(1)), Value::Int(1));
        assert_eq!(Value::from_json(&serde_json::json!(1.5)), Value::Float(1.5));
        assert_eq!(
            Value::from_json(&serde_json::json!("plain")),
            Value::String("plain".into())
        );
    }

    #[test]
    fn test_from_json_detects_timestamps() {
        let rfc = Value::from_json(&serde_json::json!("2024-06-01T12:00:00Z"));
        assert!(matches!(rfc, Value::Timestamp(_)));

        let offset = Value::from_json(&serde_json::json!("2024-06-01T12:00:00+00:00"));
        assert_eq!(rfc, offset);

        let bare = Value::from_json(&serde_json::json!("2024-06-01 12:00:00"));
        assert_eq!(rfc, bare);

        // Short or non-date strings stay strings.
        assert_eq!(
            Value::from_json(&serde_json::json!("2024-06")),
            Value::String("2024-06".into())
        );
    }

    #[test]
    fn test_from_json_string_array_becomes_list() {
        let v = Value::from_json(&serde_json::json!(["b", "a"]));
        assert_eq!(v, Value::List(vec!["b".into(), "a".into()]));
    }

    #[test]
    fn test_from_json_stringifies_objects() {
        let v = Value::from_json(&serde_json::json!({"name": "x", "id": 1}));
        // serde_json orders object keys, so the rendering is stable.
        assert_eq!(v, Value::String(r#"{"id":1,"name":"x"}"#.into()));
    }

    #[test]
    fn test_timestamp_to_json_truncates_to_seconds() {
        let ts = DateTime::parse_from_rfc3339("2024-06-01T12:00:00.987Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(
            Value::Timestamp(ts).to_json(),
            serde_json::json!("2024-06-01T12:00:00Z")
        );
    }

    #[test]
    fn test_action_roundtrip() {
        for action in [ChangeAction::Insert, ChangeAction::Update, ChangeAction::Delete] {
            assert_eq!(ChangeAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(ChangeAction::parse("insert"), Some(ChangeAction::Insert));
        assert_eq!(ChangeAction::parse("TRUNCATE"), None);
    }

    #[test]
    fn test_direction_opposite() {
        assert_eq!(Direction::SheetToDb.opposite(), Direction::DbToSheet);
        assert_eq!(Direction::DbToSheet.opposite(), Direction::SheetToDb);
    }

    #[test]
    fn test_queue_row_payload() {
        let row = QueueRow {
            id: 1,
            table_name: "users".into(),
            record_id: "k1".into(),
            action: ChangeAction::Delete,
            old_row: Some(serde_json::json!({"name": "a"})),
            new_row: None,
            sync_hash: None,
            retry_count: 0,
            created_at: Utc::now(),
        };
        assert!(row.payload().is_some());
    }
}

use chrono::SecondsFormat;

use crate::types::{RowMap, Value};

/// Columns excluded from fingerprints: they are owned by the sync machinery
/// or carry sub-second jitter that would defeat loop detection.
pub const SYSTEM_COLUMNS: &[&str] = &["id", "external_id", "_sync_source", "created_at", "updated_at"];

/// Render a row as canonical JSON: keys are DB column names in lexicographic
/// order, system columns and nulls omitted, values normalized per type.
/// Both directions must produce byte-identical output for the same logical
/// content, since the fingerprint of this string is what the anti-loop
/// ledger and the DB trigger compare.
pub fn canonical_json(row: &RowMap) -> String {
    let mut map = serde_json::Map::new();

    for (column, value) in row {
        if SYSTEM_COLUMNS.contains(&column.as_str()) || value.is_null() {
            continue;
        }
        map.insert(column.clone(), canonical_value(value));
    }

    // serde_json's default Map is ordered, so this is already sorted by key.
    serde_json::Value::Object(map).to_string()
}

fn canonical_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => {
            let rounded = (f * 1e9).round() / 1e9;
            serde_json::Number::from_f64(rounded)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null)
        }
        Value::String(s) => serde_json::Value::String(s.trim().to_string()),
        Value::Timestamp(ts) => {
            serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true))
        }
        // Lists canonicalize to their comma-joined form, which is also how
        // they are stored in the DB column. The mapper has already sorted
        // and deduplicated set-valued lists, so both sides converge.
        Value::List(items) => serde_json::Value::String(items.join(",")),
    }
}

/// 128-bit content hash over the canonical payload, lower-case hex.
/// MD5 matches the 32-char `sync_hash` the DB triggers store; the hash is
/// an identity for loop detection, not a security boundary.
pub fn fingerprint(row: &RowMap) -> String {
    format!("{:x}", md5::compute(canonical_json(row)))
}

/// Fingerprint an unmappable payload as-is. Used when a record fails field
/// mapping: the snapshot still needs a stable hash for it so the same
/// broken record is not reported again every poll.
pub fn fingerprint_raw(payload: &serde_json::Value) -> String {
    format!("{:x}", md5::compute(payload.to_string()))
}

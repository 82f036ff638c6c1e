use std::collections::HashMap;

use chrono::SecondsFormat;

use crate::error::{Error, Result};
use crate::fingerprint::SYSTEM_COLUMNS;
use crate::pair::TablePair;
use crate::types::{RowMap, Value};

/// Translate a Sheet record's fields into a DB row. Unmapped fields are
/// dropped; multi-select sets are sorted and deduplicated. Returns the
/// record's key value alongside the mapped row.
///
/// Fails with a mapping error when the key field's Sheet-side column is
/// missing or non-scalar.
pub fn sheet_to_db(
    pair: &TablePair,
    fields: &HashMap<String, serde_json::Value>,
) -> Result<(String, RowMap)> {
    let mut row = RowMap::new();

    for (sheet_field, db_column) in pair.field_map.iter() {
        let Some(raw) = fields.get(sheet_field) else {
            continue;
        };

        let mut value = Value::from_json(raw);
        if pair.field_map.is_multi_select(db_column) {
            value = normalize_set(value);
        }
        row.insert(db_column.to_string(), value);
    }

    let key = key_from_row(pair, &row)?;
    Ok((key, row))
}

/// Extract the key value from a mapped row.
pub fn key_from_row(pair: &TablePair, row: &RowMap) -> Result<String> {
    match row.get(&pair.key_field) {
        None => Err(Error::MissingKeyField(pair.key_field.clone())),
        Some(value) => value.as_key().ok_or_else(|| Error::NonScalarKey {
            field: pair.key_field.clone(),
        }),
    }
}

/// Translate a DB row into the field map the Sheet expects. Timestamps are
/// rendered in the Sheet's string form; multi-select columns are split back
/// into arrays.
pub fn db_to_sheet(pair: &TablePair, row: &RowMap) -> HashMap<String, serde_json::Value> {
    let mut fields = HashMap::new();

    for (sheet_field, db_column) in pair.field_map.iter() {
        let Some(value) = row.get(db_column) else {
            continue;
        };
        if value.is_null() {
            continue;
        }

        let rendered = match value {
            Value::Timestamp(ts) => serde_json::Value::String(
                ts.to_rfc3339_opts(SecondsFormat::Secs, true),
            ),
            Value::String(s) if pair.field_map.is_multi_select(db_column) => {
                split_set(s)
            }
            Value::List(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|s| serde_json::Value::String(s.clone()))
                    .collect(),
            ),
            other => other.to_json(),
        };
        fields.insert(sheet_field.to_string(), rendered);
    }

    fields
}

/// Outbound strictness for schema drift. A queue payload carrying a column
/// that is neither mapped nor a system column cannot be written to the
/// Sheet faithfully; dropping it would silently lose data. Unknown columns
/// on read are ignored, unknown columns on an outbound write are a mapping
/// error.
pub fn check_outbound_columns(pair: &TablePair, payload: &serde_json::Value) -> Result<()> {
    let Some(object) = payload.as_object() else {
        return Ok(());
    };

    for column in object.keys() {
        if !pair.field_map.contains_db_column(column)
            && !SYSTEM_COLUMNS.contains(&column.as_str())
        {
            return Err(Error::UnknownField(column.clone()));
        }
    }
    Ok(())
}

/// Project a queue row's JSON payload onto the pair's mapped columns.
/// Columns outside the field map are ignored (schema drift on read), so the
/// fingerprint covers exactly what the Sheet side fingerprints.
pub fn project_db_row(pair: &TablePair, payload: &serde_json::Value) -> RowMap {
    let mut row = RowMap::new();

    let Some(object) = payload.as_object() else {
        return row;
    };

    for db_column in pair.field_map.db_columns() {
        let Some(raw) = object.get(db_column) else {
            continue;
        };

        let mut value = Value::from_json(raw);
        if pair.field_map.is_multi_select(db_column) {
            if let Value::String(s) = &value {
                value = Value::List(s.split(',').map(|p| p.trim().to_string()).collect());
            }
            value = normalize_set(value);
        }
        row.insert(db_column.to_string(), value);
    }

    row
}

fn normalize_set(value: Value) -> Value {
    match value {
        Value::List(mut items) => {
            items.sort();
            items.dedup();
            Value::List(items)
        }
        other => other,
    }
}

fn split_set(joined: &str) -> serde_json::Value {
    serde_json::Value::Array(
        joined
            .split(',')
            .map(|p| serde_json::Value::String(p.trim().to_string()))
            .collect(),
    )
}

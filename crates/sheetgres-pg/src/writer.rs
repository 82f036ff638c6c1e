//! Statement building for applying Sheet changes to the target tables.
//!
//! Every DML the writer issues carries `_sync_source = 'sheet'` so the
//! operator's triggers do not enqueue the write back into `sync_queue`.
//! The key comparison is done through a `::text` cast so string key values
//! from the id mapping work against any scalar key column type.

use chrono::{DateTime, Utc};
use tokio_postgres::types::ToSql;
use tokio_postgres::Transaction;

use sheetgres_core::{RowMap, TablePair, Value};

use crate::error::PgResult;

pub(crate) async fn insert_row(tx: &Transaction<'_>, pair: &TablePair, row: &RowMap) -> PgResult<()> {
    let columns = sorted_columns(row);
    let statement = insert_statement(&pair.db_table, &columns);
    let params = row_params(row, &columns);

    tx.execute(statement.as_str(), &param_refs(&params)).await?;
    Ok(())
}

pub(crate) async fn update_row(
    tx: &Transaction<'_>,
    pair: &TablePair,
    row: &RowMap,
    key_value: &str,
) -> PgResult<u64> {
    let columns = sorted_columns(row);
    let statement = update_statement(&pair.db_table, &columns, &pair.key_field);
    let mut params = row_params(row, &columns);
    params.push(Box::new(key_value.to_string()));

    Ok(tx.execute(statement.as_str(), &param_refs(&params)).await?)
}

pub(crate) async fn delete_row(
    tx: &Transaction<'_>,
    pair: &TablePair,
    key_value: &str,
) -> PgResult<u64> {
    let statement = delete_statement(&pair.db_table, &pair.key_field);
    Ok(tx.execute(statement.as_str(), &[&key_value]).await?)
}

fn sorted_columns(row: &RowMap) -> Vec<String> {
    let mut columns: Vec<String> = row.keys().cloned().collect();
    columns.sort();
    columns
}

fn insert_statement(table: &str, columns: &[String]) -> String {
    let column_list: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();

    format!(
        "INSERT INTO {} ({}, \"_sync_source\") VALUES ({}, 'sheet')",
        quote_ident(table),
        column_list.join(", "),
        placeholders.join(", "),
    )
}

fn update_statement(table: &str, columns: &[String], key_field: &str) -> String {
    let assignments: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{} = ${}", quote_ident(c), i + 1))
        .collect();

    format!(
        "UPDATE {} SET {}, \"_sync_source\" = 'sheet' WHERE {}::text = ${}",
        quote_ident(table),
        assignments.join(", "),
        quote_ident(key_field),
        columns.len() + 1,
    )
}

fn delete_statement(table: &str, key_field: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {}::text = $1",
        quote_ident(table),
        quote_ident(key_field),
    )
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn row_params(row: &RowMap, columns: &[String]) -> Vec<Box<dyn ToSql + Sync + Send>> {
    columns
        .iter()
        .map(|column| sql_value(row.get(column).unwrap_or(&Value::Null)))
        .collect()
}

fn sql_value(value: &Value) -> Box<dyn ToSql + Sync + Send> {
    match value {
        Value::Null => Box::new(Option::<String>::None),
        Value::Bool(b) => Box::new(*b),
        Value::Int(i) => Box::new(*i),
        Value::Float(f) => Box::new(*f),
        Value::String(s) => Box::new(s.clone()),
        Value::Timestamp(ts) => {
            let ts: DateTime<Utc> = *ts;
            Box::new(ts)
        }
        // Multi-select sets are stored comma-joined, the same rendering the
        // fingerprint canonicalization uses.
        Value::List(items) => Box::new(items.join(",")),
    }
}

fn param_refs(params: &[Box<dyn ToSql + Sync + Send>]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_statement_shape() {
        let stmt = insert_statement("users", &["age".into(), "name".into()]);
        assert_eq!(
            stmt,
            "INSERT INTO \"users\" (\"age\", \"name\", \"_sync_source\") VALUES ($1, $2, 'sheet')"
        );
    }

    #[test]
    fn test_update_statement_shape() {
        let stmt = update_statement("users", &["age".into(), "name".into()], "user_key");
        assert_eq!(
            stmt,
            "UPDATE \"users\" SET \"age\" = $1, \"name\" = $2, \"_sync_source\" = 'sheet' \
             WHERE \"user_key\"::text = $3"
        );
    }

    #[test]
    fn test_delete_statement_shape() {
        let stmt = delete_statement("users", "user_key");
        assert_eq!(stmt, "DELETE FROM \"users\" WHERE \"user_key\"::text = $1");
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("od\"d"), "\"od\"\"d\"");
    }
}

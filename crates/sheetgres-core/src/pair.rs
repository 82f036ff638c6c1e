use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{Error, Result};

/// Ordered mapping between Sheet field names and DB column names.
/// Fields not mentioned are ignored in both directions.
#[derive(Debug, Clone, Default)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
    sheet_to_db: HashMap<String, String>,
    db_to_sheet: HashMap<String, String>,
    multi_select: HashSet<String>,
}

impl FieldMap {
    pub fn new(entries: Vec<(String, String)>) -> Result<Self> {
        let mut sheet_to_db = HashMap::new();
        let mut db_to_sheet = HashMap::new();

        for (sheet, db) in &entries {
            if db_to_sheet.insert(db.clone(), sheet.clone()).is_some() {
                return Err(Error::DuplicateColumn(db.clone()));
            }
            sheet_to_db.insert(sheet.clone(), db.clone());
        }

        Ok(Self {
            entries,
            sheet_to_db,
            db_to_sheet,
            multi_select: HashSet::new(),
        })
    }

    /// Mark DB columns whose values are multi-select sets. Sets are sorted
    /// and deduplicated on read and stored comma-joined in the DB.
    pub fn with_multi_select(mut self, columns: Vec<String>) -> Self {
        self.multi_select = columns.into_iter().collect();
        self
    }

    pub fn db_column(&self, sheet_field: &str) -> Option<&str> {
        self.sheet_to_db.get(sheet_field).map(String::as_str)
    }

    pub fn sheet_field(&self, db_column: &str) -> Option<&str> {
        self.db_to_sheet.get(db_column).map(String::as_str)
    }

    pub fn contains_db_column(&self, db_column: &str) -> bool {
        self.db_to_sheet.contains_key(db_column)
    }

    pub fn is_multi_select(&self, db_column: &str) -> bool {
        self.multi_select.contains(db_column)
    }

    /// Pairs in declaration order: `(sheet_field, db_column)`.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(s, d)| (s.as_str(), d.as_str()))
    }

    pub fn db_columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, d)| d.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A configured Sheet-table ↔ DB-table mapping. The unit of sync.
#[derive(Debug, Clone)]
pub struct TablePair {
    /// Stable identifier, `"<sheet_db>:<sheet_table>"`.
    pub name: String,
    pub sheet_db: String,
    pub sheet_table: String,
    pub db_table: String,
    /// DB column that serves as external identity. Must be a mapped column.
    pub key_field: String,
    pub poll_interval: Duration,
    pub field_map: FieldMap,
}

impl TablePair {
    pub fn builder(sheet_db: impl Into<String>, sheet_table: impl Into<String>) -> TablePairBuilder {
        TablePairBuilder::new(sheet_db, sheet_table)
    }
}

/// Builder for constructing a TablePair.
pub struct TablePairBuilder {
    sheet_db: String,
    sheet_table: String,
    db_table: Option<String>,
    key_field: Option<String>,
    poll_interval: Duration,
    field_map: FieldMap,
}

impl TablePairBuilder {
    pub fn new(sheet_db: impl Into<String>, sheet_table: impl Into<String>) -> Self {
        Self {
            sheet_db: sheet_db.into(),
            sheet_table: sheet_table.into(),
            db_table: None,
            key_field: None,
            poll_interval: Duration::from_secs(5),
            field_map: FieldMap::default(),
        }
    }

    pub fn db_table(mut self, table: impl Into<String>) -> Self {
        self.db_table = Some(table.into());
        self
    }

    pub fn key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn field_map(mut self, map: FieldMap) -> Self {
        self.field_map = map;
        self
    }

    pub fn build(self) -> Result<TablePair> {
        let db_table = self
            .db_table
            .ok_or_else(|| Error::MissingKeyField("db_table".into()))?;
        let key_field = self
            .key_field
            .ok_or_else(|| Error::MissingKeyField("key_field".into()))?;

        if !self.field_map.contains_db_column(&key_field) {
            return Err(Error::MissingKeyField(key_field));
        }

        Ok(TablePair {
            name: format!("{}:{}", self.sheet_db, self.sheet_table),
            sheet_db: self.sheet_db,
            sheet_table: self.sheet_table,
            db_table,
            key_field,
            poll_interval: self.poll_interval,
            field_map: self.field_map,
        })
    }
}

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{RecordPage, SheetClient, SheetRecord};
use crate::error::{SheetError, SheetResult};

/// A mock Sheet client for testing. Holds in-memory tables, records every
/// write, and can inject failures or rate-limit responses.
#[derive(Clone, Default)]
pub struct MockSheetClient {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    /// Records by (db, table), in insertion order.
    tables: HashMap<(String, String), Vec<SheetRecord>>,
    /// Every successful mutation, in order.
    writes: Vec<MockWrite>,
    /// If set, all operations fail with a network error.
    fail_with: Option<String>,
    /// Remaining operations that should answer 429.
    rate_limit_remaining: usize,
    /// Page size for list_records; 0 means everything in one page.
    page_size: usize,
    next_id: u64,
}

/// A recorded mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MockWrite {
    Create { table: String, external_id: String },
    Update { table: String, external_id: String },
    Delete { table: String, external_id: String },
}

impl MockSheetClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock that fails every operation.
    pub fn failing(message: impl Into<String>) -> Self {
        let client = Self::new();
        client.state.lock().unwrap().fail_with = Some(message.into());
        client
    }

    /// Seed a record directly (no write recorded). Returns its id.
    pub fn seed_record(
        &self,
        db: &str,
        table: &str,
        fields: HashMap<String, serde_json::Value>,
    ) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("rec{}", state.next_id);
        state
            .tables
            .entry((db.to_string(), table.to_string()))
            .or_default()
            .push(SheetRecord {
                id: id.clone(),
                fields,
            });
        id
    }

    /// Remove a record directly, as if a user deleted it.
    pub fn remove_record(&self, db: &str, table: &str, external_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(records) = state.tables.get_mut(&(db.to_string(), table.to_string())) {
            records.retain(|r| r.id != external_id);
        }
    }

    /// Overwrite a record's fields directly, as if a user edited it.
    pub fn edit_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: HashMap<String, serde_json::Value>,
    ) {
        let mut state = self.state.lock().unwrap();
        if let Some(records) = state.tables.get_mut(&(db.to_string(), table.to_string())) {
            if let Some(record) = records.iter_mut().find(|r| r.id == external_id) {
                record.fields = fields;
            }
        }
    }

    pub fn records(&self, db: &str, table: &str) -> Vec<SheetRecord> {
        self.state
            .lock()
            .unwrap()
            .tables
            .get(&(db.to_string(), table.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn writes(&self) -> Vec<MockWrite> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn total_writes(&self) -> usize {
        self.state.lock().unwrap().writes.len()
    }

    /// Answer the next `n` operations with 429.
    pub fn rate_limit_next(&self, n: usize) {
        self.state.lock().unwrap().rate_limit_remaining = n;
    }

    pub fn set_page_size(&self, size: usize) {
        self.state.lock().unwrap().page_size = size;
    }

    fn gate(state: &mut MockState) -> SheetResult<()> {
        if let Some(ref message) = state.fail_with {
            return Err(SheetError::Network(message.clone()));
        }
        if state.rate_limit_remaining > 0 {
            state.rate_limit_remaining -= 1;
            return Err(SheetError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            });
        }
        Ok(())
    }
}

impl SheetClient for MockSheetClient {
    fn list_records(
        &self,
        db: &str,
        table: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = SheetResult<RecordPage>> + Send {
        let state = self.state.clone();
        let key = (db.to_string(), table.to_string());
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        async move {
            let mut state = state.lock().unwrap();
            Self::gate(&mut state)?;

            let records = state.tables.get(&key).cloned().unwrap_or_default();
            if state.page_size == 0 {
                return Ok(RecordPage {
                    records,
                    next_cursor: None,
                });
            }

            let end = (offset + state.page_size).min(records.len());
            let page = records[offset.min(records.len())..end].to_vec();
            let next_cursor = (end < records.len()).then(|| end.to_string());
            Ok(RecordPage {
                records: page,
                next_cursor,
            })
        }
    }

    fn create_record(
        &self,
        db: &str,
        table: &str,
        fields: HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = SheetResult<String>> + Send {
        let state = self.state.clone();
        let key = (db.to_string(), table.to_string());
        let table = table.to_string();

        async move {
            let mut state = state.lock().unwrap();
            Self::gate(&mut state)?;

            state.next_id += 1;
            let id = format!("rec{}", state.next_id);
            state.tables.entry(key).or_default().push(SheetRecord {
                id: id.clone(),
                fields,
            });
            state.writes.push(MockWrite::Create {
                table,
                external_id: id.clone(),
            });
            Ok(id)
        }
    }

    fn update_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
        fields: HashMap<String, serde_json::Value>,
    ) -> impl Future<Output = SheetResult<()>> + Send {
        let state = self.state.clone();
        let key = (db.to_string(), table.to_string());
        let table = table.to_string();
        let external_id = external_id.to_string();

        async move {
            let mut state = state.lock().unwrap();
            Self::gate(&mut state)?;

            let record = state
                .tables
                .get_mut(&key)
                .and_then(|records| records.iter_mut().find(|r| r.id == external_id));

            match record {
                Some(record) => {
                    record.fields = fields;
                    state.writes.push(MockWrite::Update {
                        table,
                        external_id,
                    });
                    Ok(())
                }
                None => Err(SheetError::NotFound(external_id)),
            }
        }
    }

    fn delete_record(
        &self,
        db: &str,
        table: &str,
        external_id: &str,
    ) -> impl Future<Output = SheetResult<()>> + Send {
        let state = self.state.clone();
        let key = (db.to_string(), table.to_string());
        let table = table.to_string();
        let external_id = external_id.to_string();

        async move {
            let mut state = state.lock().unwrap();
            Self::gate(&mut state)?;

            let records = state.tables.get_mut(&key);
            let existed = records
                .map(|records| {
                    let before = records.len();
                    records.retain(|r| r.id != external_id);
                    records.len() < before
                })
                .unwrap_or(false);

            if existed {
                state.writes.push(MockWrite::Delete {
                    table,
                    external_id,
                });
                Ok(())
            } else {
                Err(SheetError::NotFound(external_id))
            }
        }
    }

    fn query_records(
        &self,
        db: &str,
        table: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> impl Future<Output = SheetResult<Vec<SheetRecord>>> + Send {
        let state = self.state.clone();
        let key = (db.to_string(), table.to_string());
        let field = field.to_string();
        let value = value.clone();

        async move {
            let mut state = state.lock().unwrap();
            Self::gate(&mut state)?;

            Ok(state
                .tables
                .get(&key)
                .map(|records| {
                    records
                        .iter()
                        .filter(|r| r.fields.get(&field) == Some(&value))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }
    }

    fn ping(&self) -> impl Future<Output = SheetResult<()>> + Send {
        let state = self.state.clone();
        async move {
            let mut state = state.lock().unwrap();
            Self::gate(&mut state)
        }
    }
}

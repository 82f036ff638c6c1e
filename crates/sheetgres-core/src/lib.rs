pub mod backoff;
pub mod diff;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod mapper;
pub mod pair;
pub mod types;

pub use backoff::BackoffPolicy;
pub use diff::{diff, Snapshot};
pub use error::{Error, FailureKind, Result};
pub use fingerprint::{canonical_json, fingerprint, fingerprint_raw, SYSTEM_COLUMNS};
pub use ledger::Ledger;
pub use mapper::{check_outbound_columns, db_to_sheet, key_from_row, project_db_row, sheet_to_db};
pub use pair::{FieldMap, TablePair, TablePairBuilder};
pub use types::{ChangeAction, ChangeEvent, Direction, QueueRow, QueueStatus, RowMap, Value};

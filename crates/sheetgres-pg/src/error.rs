use sheetgres_core::FailureKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("unique key violation: {0}")]
    UniqueViolation(String),

    #[error("no row matched key '{0}'")]
    RowNotFound(String),

    #[error("missing trigger on table '{0}'")]
    TriggerMissing(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid queue row {id}: {reason}")]
    InvalidQueueRow { id: i64, reason: String },
}

impl PgError {
    /// Map onto the engine's failure taxonomy.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PgError::Postgres(_) | PgError::Connection(_) => FailureKind::TransientNetwork,
            PgError::UniqueViolation(_) => FailureKind::Conflict,
            PgError::RowNotFound(_) => FailureKind::NotFound,
            PgError::TriggerMissing(_) => FailureKind::Fatal,
            PgError::Json(_) | PgError::InvalidQueueRow { .. } => FailureKind::Mapping,
        }
    }
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(db_err) = e.as_db_error() {
            if db_err.code() == &tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                return PgError::UniqueViolation(db_err.message().to_string());
            }
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;

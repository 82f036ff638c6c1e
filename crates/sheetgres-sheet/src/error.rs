use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SheetError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited{}", retry_after.map(|d| format!(", retry after {:?}", d)).unwrap_or_default())]
    RateLimited { retry_after: Option<Duration> },

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("sheet api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("credentials rejected")]
    Unauthorized,

    #[error("invalid record payload: {0}")]
    InvalidRecord(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SheetError {
    /// Whether the operation is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SheetError::Network(_) | SheetError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for SheetError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            SheetError::Network(e.to_string())
        } else {
            SheetError::Api {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

pub type SheetResult<T> = Result<T, SheetError>;

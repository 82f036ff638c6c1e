use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in sheetgres-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("missing key field '{0}' in record")]
    MissingKeyField(String),

    #[error("key field '{field}' is not a scalar value")]
    NonScalarKey { field: String },

    #[error("unknown field '{0}' in outbound record")]
    UnknownField(String),

    #[error("duplicate target column '{0}' in field map")]
    DuplicateColumn(String),

    #[error("anti-loop window {0:?} outside supported range [2s, 120s]")]
    InvalidWindow(Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of sync failures, as seen by the supervisor.
///
/// Components convert their own errors into one of these kinds at the
/// boundary; retry and pause decisions are made on the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Network-level failure or upstream 5xx. Retried with backoff.
    TransientNetwork,
    /// Quota exceeded. Retried after the advertised delay, with the
    /// client's rate reduced for a recovery window.
    RateLimited,
    /// The record cannot be translated (missing key, unknown field).
    /// Never retried.
    Mapping,
    /// Unique-key violation while applying. One compensating update is
    /// attempted before giving up.
    Conflict,
    /// The target record does not exist. Degraded, not retried.
    NotFound,
    /// Invalid configuration or contract violation. Aborts startup.
    Fatal,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::TransientNetwork | FailureKind::RateLimited)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientNetwork => "transient_network",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Mapping => "mapping",
            FailureKind::Conflict => "conflict",
            FailureKind::NotFound => "not_found",
            FailureKind::Fatal => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(FailureKind::TransientNetwork.is_retryable());
        assert!(FailureKind::RateLimited.is_retryable());
        assert!(!FailureKind::Mapping.is_retryable());
        assert!(!FailureKind::Conflict.is_retryable());
        assert!(!FailureKind::NotFound.is_retryable());
        assert!(!FailureKind::Fatal.is_retryable());
    }
}

use thiserror::Error;

/// Configuration problems. All of these abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("no [[pairs]] configured; nothing to sync")]
    NoPairs,

    #[error("window_s = {0} outside supported range [2, 120]")]
    InvalidWindow(u64),

    #[error("poll_interval_s = {0} below minimum of 2")]
    PollTooShort(u64),

    #[error("batch_size = {size} outside [1, {cap}]")]
    InvalidBatchSize { size: i64, cap: i64 },

    #[error("pause_on_error_rate = {0} outside [0, 1]")]
    InvalidErrorRate(f64),

    #[error("rate_limit_qps = {0} must be positive")]
    InvalidQps(f64),

    #[error("pair '{pair}': key_field '{key_field}' is not a mapped column")]
    KeyFieldNotMapped { pair: String, key_field: String },

    #[error("pair '{pair}': multi_select column '{column}' is not a mapped column")]
    MultiSelectNotMapped { pair: String, column: String },

    #[error("duplicate pair '{0}'")]
    DuplicatePair(String),

    #[error("invalid pair definition: {0}")]
    Pair(#[from] sheetgres_core::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

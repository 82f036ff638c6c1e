use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::ConfigResult;

/// Project configuration from sheetgres.toml.
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    pub postgres: PostgresConfig,
    pub sheet: SheetConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
}

impl ProjectConfig {
    /// Parse a config from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Resolve `${VAR_NAME}` references against the process environment.
    pub fn resolve_env(s: &str) -> String {
        let mut result = s.to_string();

        while let Some(start) = result.find("${") {
            if let Some(end) = result[start..].find('}') {
                let var_name = &result[start + 2..start + end];
                let value = std::env::var(var_name).unwrap_or_default();
                result = format!("{}{}{}", &result[..start], value, &result[start + end + 1..]);
            } else {
                break;
            }
        }

        result
    }

    pub fn postgres_connection_string(&self) -> String {
        Self::resolve_env(&self.postgres.connection_string)
    }

    pub fn sheet_app_token(&self) -> String {
        Self::resolve_env(&self.sheet.app_token)
    }
}

#[derive(Debug, Deserialize)]
pub struct PostgresConfig {
    pub connection_string: String,
}

#[derive(Debug, Deserialize)]
pub struct SheetConfig {
    pub base_url: String,
    pub app_token: String,
}

/// Engine tuning. Every field has a default matching the documented
/// behavior, so a minimal config only needs connections and pairs.
#[derive(Debug, Deserialize)]
pub struct SyncConfig {
    /// Seconds between Sheet polls (min 2).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_s: u64,
    /// Anti-loop window in seconds, range [2, 120].
    #[serde(default = "default_window")]
    pub window_s: u64,
    /// Queue claim batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    /// Upper bound the watchdog may widen the batch to.
    #[serde(default = "default_batch_cap")]
    pub batch_cap: i64,
    /// Attempts before a queue row becomes `failed`.
    #[serde(default = "default_retry_max")]
    pub retry_max: i32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_s: u64,
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_s: u64,
    /// Sheet client QPS cap, shared across all tasks.
    #[serde(default = "default_qps")]
    pub rate_limit_qps: f64,
    /// 5-minute failure rate that pauses a pair, in [0, 1].
    #[serde(default = "default_error_rate")]
    pub pause_on_error_rate: f64,
    /// How long a pair stays paused, seconds.
    #[serde(default = "default_pause")]
    pub pause_s: u64,
    /// Queue depth that triggers batch widening.
    #[serde(default = "default_queue_alarm")]
    pub queue_alarm_depth: i64,
    #[serde(default = "default_consumer_workers")]
    pub consumer_workers: usize,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_s: u64,
    /// Claims older than this are recovered to `pending` at startup.
    #[serde(default = "default_stale_claim")]
    pub stale_claim_s: u64,
    /// sync_log retention for the hourly cleanup.
    #[serde(default = "default_log_retention")]
    pub log_retention_s: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_s: default_poll_interval(),
            window_s: default_window(),
            batch_size: default_batch_size(),
            batch_cap: default_batch_cap(),
            retry_max: default_retry_max(),
            backoff_base_s: default_backoff_base(),
            backoff_cap_s: default_backoff_cap(),
            rate_limit_qps: default_qps(),
            pause_on_error_rate: default_error_rate(),
            pause_s: default_pause(),
            queue_alarm_depth: default_queue_alarm(),
            consumer_workers: default_consumer_workers(),
            snapshot_dir: default_snapshot_dir(),
            shutdown_grace_s: default_shutdown_grace(),
            stale_claim_s: default_stale_claim(),
            log_retention_s: default_log_retention(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
        }
    }
}

/// One synced table pair.
#[derive(Debug, Deserialize)]
pub struct PairConfig {
    pub sheet_db: String,
    pub sheet_table: String,
    pub db_table: String,
    /// DB column serving as external identity; must appear in `fields`.
    pub key_field: String,
    /// Per-pair poll interval override, seconds.
    pub poll_interval_s: Option<u64>,
    /// Sheet field name → DB column name.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// DB columns holding multi-select sets.
    #[serde(default)]
    pub multi_select: Vec<String>,
}

impl PairConfig {
    pub fn name(&self) -> String {
        format!("{}:{}", self.sheet_db, self.sheet_table)
    }
}

fn default_poll_interval() -> u64 {
    5
}

fn default_window() -> u64 {
    10
}

fn default_batch_size() -> i64 {
    10
}

fn default_batch_cap() -> i64 {
    100
}

fn default_retry_max() -> i32 {
    3
}

fn default_backoff_base() -> u64 {
    2
}

fn default_backoff_cap() -> u64 {
    300
}

fn default_qps() -> f64 {
    10.0
}

fn default_error_rate() -> f64 {
    0.10
}

fn default_pause() -> u64 {
    60
}

fn default_queue_alarm() -> i64 {
    1_000
}

fn default_consumer_workers() -> usize {
    4
}

fn default_snapshot_dir() -> String {
    "snapshots".to_string()
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_stale_claim() -> u64 {
    120
}

fn default_log_retention() -> u64 {
    7 * 24 * 3600
}

fn default_metrics_port() -> u16 {
    9090
}

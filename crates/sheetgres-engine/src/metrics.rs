use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sheetgres_core::{Direction, FailureKind};
use sheetgres_pg::QueueStats;

/// Engine health counters. Shared across all tasks; rendered as Prometheus
/// text on the metrics endpoint and as JSON for the `status` command.
pub struct Metrics {
    started_at: Instant,
    success_sheet_to_db: AtomicU64,
    success_db_to_sheet: AtomicU64,
    failures: Mutex<HashMap<(Direction, FailureKind), u64>>,
    skips: Mutex<HashMap<String, u64>>,
    queue_depth: AtomicI64,
    queue: Mutex<QueueStats>,
    poll_overruns: AtomicU64,
    ledger_entries: AtomicU64,
    latency_micros_sum: AtomicU64,
    latency_count: AtomicU64,
    paused: Mutex<HashMap<String, PausedPair>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            success_sheet_to_db: AtomicU64::new(0),
            success_db_to_sheet: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
            skips: Mutex::new(HashMap::new()),
            queue_depth: AtomicI64::new(0),
            queue: Mutex::new(QueueStats::default()),
            poll_overruns: AtomicU64::new(0),
            ledger_entries: AtomicU64::new(0),
            latency_micros_sum: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
            paused: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, direction: Direction, latency: Duration) {
        match direction {
            Direction::SheetToDb => self.success_sheet_to_db.fetch_add(1, Ordering::Relaxed),
            Direction::DbToSheet => self.success_db_to_sheet.fetch_add(1, Ordering::Relaxed),
        };
        self.latency_micros_sum
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, direction: Direction, kind: FailureKind) {
        let mut failures = self.failures.lock().unwrap();
        *failures.entry((direction, kind)).or_insert(0) += 1;
    }

    pub fn record_skip(&self, reason: &str) {
        let mut skips = self.skips.lock().unwrap();
        *skips.entry(reason.to_string()).or_insert(0) += 1;
    }

    pub fn set_queue_depth(&self, depth: i64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Publish the latest queue breakdown; the depth gauge tracks pending.
    pub fn set_queue_stats(&self, stats: &QueueStats) {
        self.set_queue_depth(stats.pending);
        *self.queue.lock().unwrap() = stats.clone();
    }

    pub fn incr_poll_overruns(&self) {
        self.poll_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_ledger_entries(&self, count: u64) {
        self.ledger_entries.store(count, Ordering::Relaxed);
    }

    pub fn set_paused(&self, pair: &str, reason: &str) {
        let mut paused = self.paused.lock().unwrap();
        paused
            .entry(pair.to_string())
            .or_insert_with(|| PausedPair {
                pair: pair.to_string(),
                since: Utc::now(),
                reason: reason.to_string(),
            });
    }

    pub fn clear_paused(&self, pair: &str) {
        self.paused.lock().unwrap().remove(pair);
    }

    pub fn success_total(&self, direction: Direction) -> u64 {
        match direction {
            Direction::SheetToDb => self.success_sheet_to_db.load(Ordering::Relaxed),
            Direction::DbToSheet => self.success_db_to_sheet.load(Ordering::Relaxed),
        }
    }

    pub fn skip_total(&self, reason: &str) -> u64 {
        self.skips.lock().unwrap().get(reason).copied().unwrap_or(0)
    }

    fn avg_latency_seconds(&self) -> f64 {
        let count = self.latency_count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let sum = self.latency_micros_sum.load(Ordering::Relaxed);
        (sum as f64 / count as f64) / 1e6
    }

    /// Render in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# TYPE sync_success_total counter\n");
        for direction in [Direction::SheetToDb, Direction::DbToSheet] {
            out.push_str(&format!(
                "sync_success_total{{direction=\"{}\"}} {}\n",
                direction.as_str(),
                self.success_total(direction)
            ));
        }

        out.push_str("# TYPE sync_failure_total counter\n");
        {
            let failures = self.failures.lock().unwrap();
            let mut entries: Vec<_> = failures.iter().collect();
            entries.sort_by_key(|((d, k), _)| (d.as_str(), k.as_str()));
            for ((direction, kind), count) in entries {
                out.push_str(&format!(
                    "sync_failure_total{{direction=\"{}\",kind=\"{}\"}} {}\n",
                    direction.as_str(),
                    kind.as_str(),
                    count
                ));
            }
        }

        out.push_str("# TYPE sync_skip_total counter\n");
        {
            let skips = self.skips.lock().unwrap();
            let mut entries: Vec<_> = skips.iter().collect();
            entries.sort();
            for (reason, count) in entries {
                out.push_str(&format!(
                    "sync_skip_total{{reason=\"{}\"}} {}\n",
                    reason, count
                ));
            }
        }

        out.push_str("# TYPE queue_depth gauge\n");
        out.push_str(&format!(
            "queue_depth {}\n",
            self.queue_depth.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE poll_overruns_total counter\n");
        out.push_str(&format!(
            "poll_overruns_total {}\n",
            self.poll_overruns.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE ledger_entries gauge\n");
        out.push_str(&format!(
            "ledger_entries {}\n",
            self.ledger_entries.load(Ordering::Relaxed)
        ));

        out.push_str("# TYPE avg_sync_latency_seconds gauge\n");
        out.push_str(&format!(
            "avg_sync_latency_seconds {:.6}\n",
            self.avg_latency_seconds()
        ));

        out
    }

    /// Snapshot for the `status` command.
    pub fn status(&self) -> StatusReport {
        let failures = self.failures.lock().unwrap();
        let mut failure_counts: HashMap<String, u64> = HashMap::new();
        for ((direction, kind), count) in failures.iter() {
            let key = format!("{}/{}", direction.as_str(), kind.as_str());
            failure_counts.insert(key, *count);
        }

        StatusReport {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            success_sheet_to_db: self.success_total(Direction::SheetToDb),
            success_db_to_sheet: self.success_total(Direction::DbToSheet),
            failures: failure_counts,
            skips: self.skips.lock().unwrap().clone(),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            queue: self.queue.lock().unwrap().clone(),
            poll_overruns: self.poll_overruns.load(Ordering::Relaxed),
            ledger_entries: self.ledger_entries.load(Ordering::Relaxed),
            avg_sync_latency_seconds: self.avg_latency_seconds(),
            paused: self.paused.lock().unwrap().values().cloned().collect(),
        }
    }
}

/// A pair the supervisor has paused after sustained failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PausedPair {
    pub pair: String,
    pub since: DateTime<Utc>,
    pub reason: String,
}

/// What the running instance reports to `sheetgres status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub uptime_seconds: u64,
    pub success_sheet_to_db: u64,
    pub success_db_to_sheet: u64,
    pub failures: HashMap<String, u64>,
    pub skips: HashMap<String, u64>,
    pub queue_depth: i64,
    pub queue: QueueStats,
    pub poll_overruns: u64,
    pub ledger_entries: u64,
    pub avg_sync_latency_seconds: f64,
    pub paused: Vec<PausedPair>,
}

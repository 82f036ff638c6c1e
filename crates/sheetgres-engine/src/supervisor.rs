use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sheetgres_config::{MonitorConfig, SyncConfig};
use sheetgres_core::{BackoffPolicy, Ledger, TablePair};
use sheetgres_pg::{PgResult, SyncStore};
use sheetgres_sheet::{RateLimiter, SheetClient};

use crate::consumer::Consumer;
use crate::metrics::Metrics;
use crate::poller::Poller;
use crate::server;
use crate::snapshot::SnapshotStore;

/// Sliding failure-rate window for one pair, driving the pause decision.
pub struct PairHealth {
    window: Duration,
    min_samples: usize,
    events: Mutex<VecDeque<(Instant, bool)>>,
    paused_until: Mutex<Option<Instant>>,
}

impl PairHealth {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            min_samples: 10,
            events: Mutex::new(VecDeque::new()),
            paused_until: Mutex::new(None),
        }
    }

    pub fn record(&self, success: bool) {
        let mut events = self.events.lock().unwrap();
        events.push_back((Instant::now(), success));
        Self::prune(&mut events, self.window);
    }

    /// Failure rate over the window, or None below the sample floor.
    pub fn failure_rate(&self) -> Option<f64> {
        let mut events = self.events.lock().unwrap();
        Self::prune(&mut events, self.window);

        if events.len() < self.min_samples {
            return None;
        }
        let failures = events.iter().filter(|(_, ok)| !ok).count();
        Some(failures as f64 / events.len() as f64)
    }

    pub fn pause(&self, duration: Duration) {
        *self.paused_until.lock().unwrap() = Some(Instant::now() + duration);
        // A paused pair resumes with a clean slate.
        self.events.lock().unwrap().clear();
    }

    pub fn is_paused(&self) -> bool {
        let mut paused = self.paused_until.lock().unwrap();
        match *paused {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                *paused = None;
                false
            }
            None => false,
        }
    }

    fn prune(events: &mut VecDeque<(Instant, bool)>, window: Duration) {
        let now = Instant::now();
        while let Some((at, _)) = events.front() {
            if now.duration_since(*at) > window {
                events.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Engine tuning, resolved from the validated config.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub window: Duration,
    pub batch_size: i64,
    pub batch_cap: i64,
    pub retry_max: i32,
    pub backoff: BackoffPolicy,
    pub rate_limit_qps: f64,
    pub pause_on_error_rate: f64,
    pub pause_for: Duration,
    pub queue_alarm_depth: i64,
    pub consumer_workers: usize,
    pub snapshot_dir: PathBuf,
    pub shutdown_grace: Duration,
    pub stale_claim: Duration,
    pub log_retention: Duration,
    pub metrics_port: u16,
    pub ledger_max_entries: usize,
}

impl EngineSettings {
    pub fn from_config(sync: &SyncConfig, monitor: &MonitorConfig) -> Self {
        Self {
            window: Duration::from_secs(sync.window_s),
            batch_size: sync.batch_size,
            batch_cap: sync.batch_cap,
            retry_max: sync.retry_max,
            backoff: BackoffPolicy::new(
                Duration::from_secs(sync.backoff_base_s),
                Duration::from_secs(sync.backoff_cap_s),
            ),
            rate_limit_qps: sync.rate_limit_qps,
            pause_on_error_rate: sync.pause_on_error_rate,
            pause_for: Duration::from_secs(sync.pause_s),
            queue_alarm_depth: sync.queue_alarm_depth,
            consumer_workers: sync.consumer_workers,
            snapshot_dir: PathBuf::from(&sync.snapshot_dir),
            shutdown_grace: Duration::from_secs(sync.shutdown_grace_s),
            stale_claim: Duration::from_secs(sync.stale_claim_s),
            log_retention: Duration::from_secs(sync.log_retention_s),
            metrics_port: monitor.metrics_port,
            ledger_max_entries: 10_000,
        }
    }
}

/// The engine: owns every component and runs the task set. No globals;
/// lifecycle is `run()` until the shutdown signal fires.
pub struct Engine<C: SheetClient, S: SyncStore> {
    pairs: Vec<TablePair>,
    client: Arc<C>,
    store: Arc<S>,
    ledger: Arc<Ledger>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    snapshots: Arc<SnapshotStore>,
    settings: EngineSettings,
}

impl<C, S> Engine<C, S>
where
    C: SheetClient + 'static,
    S: SyncStore + 'static,
{
    pub fn new(
        pairs: Vec<TablePair>,
        client: Arc<C>,
        store: Arc<S>,
        settings: EngineSettings,
    ) -> sheetgres_core::Result<Self> {
        let ledger = Arc::new(Ledger::new(settings.window, settings.ledger_max_entries)?);

        Ok(Self {
            pairs,
            client,
            store,
            ledger,
            limiter: Arc::new(RateLimiter::new(settings.rate_limit_qps)),
            metrics: Arc::new(Metrics::new()),
            snapshots: Arc::new(SnapshotStore::new(settings.snapshot_dir.clone())),
            settings,
        })
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Run all tasks until `shutdown` fires, then drain within the grace
    /// period. In-flight queue claims that never complete are recovered by
    /// the stale-claim sweep on the next start.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> PgResult<()> {
        let recovered = self
            .store
            .recover_stale_claims(self.settings.stale_claim)
            .await?;
        if recovered > 0 {
            info!(recovered, "Recovered stale claims from previous run");
        }

        let mut tasks: JoinSet<()> = JoinSet::new();

        tasks.spawn(server::serve(
            self.metrics.clone(),
            self.settings.metrics_port,
            shutdown.clone(),
        ));

        // One poller per pair, each with its own health window.
        let mut health_by_table: HashMap<String, Arc<PairHealth>> = HashMap::new();
        let mut health_by_name: Vec<(String, Arc<PairHealth>)> = Vec::new();

        for pair in &self.pairs {
            let health = Arc::new(PairHealth::new(Duration::from_secs(300)));
            health_by_table.insert(pair.db_table.clone(), health.clone());
            health_by_name.push((pair.name.clone(), health.clone()));

            let poller = Poller::new(
                pair.clone(),
                self.client.clone(),
                self.store.clone(),
                self.ledger.clone(),
                self.limiter.clone(),
                self.metrics.clone(),
                self.snapshots.clone(),
                health,
                self.settings.retry_max.max(0) as u32,
            );
            tasks.spawn(poller.run(shutdown.clone()));
        }

        // Shared, watchdog-adjustable claim batch size.
        let batch_size = Arc::new(AtomicI64::new(self.settings.batch_size));
        let consumer = Arc::new(Consumer::new(
            &self.pairs,
            self.client.clone(),
            self.store.clone(),
            self.ledger.clone(),
            self.limiter.clone(),
            self.metrics.clone(),
            health_by_table,
            batch_size.clone(),
            self.settings.retry_max,
            self.settings.backoff.clone(),
        ));
        for worker in 0..self.settings.consumer_workers.max(1) {
            tasks.spawn(consumer.clone().run(worker, shutdown.clone()));
        }

        tasks.spawn(prune_loop(
            self.ledger.clone(),
            self.metrics.clone(),
            shutdown.clone(),
        ));
        tasks.spawn(cleanup_loop(
            self.store.clone(),
            self.settings.log_retention,
            shutdown.clone(),
        ));
        tasks.spawn(watchdog_loop(
            self.store.clone(),
            self.metrics.clone(),
            health_by_name,
            batch_size,
            self.settings.clone(),
            shutdown.clone(),
        ));

        info!(
            pairs = self.pairs.len(),
            workers = self.settings.consumer_workers,
            "Engine running"
        );

        let mut shutdown_wait = shutdown.clone();
        let _ = shutdown_wait.changed().await;
        info!("Shutdown signal received, draining tasks");

        let drain = async {
            while tasks.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.settings.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!(
                grace_s = self.settings.shutdown_grace.as_secs(),
                "Shutdown grace expired, aborting remaining tasks"
            );
            tasks.shutdown().await;
        }

        info!("Engine stopped");
        Ok(())
    }
}

/// Expire ledger entries and publish the live count, once a second.
async fn prune_loop(ledger: Arc<Ledger>, metrics: Arc<Metrics>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let live = ledger.prune();
                metrics.set_ledger_entries(live as u64);
            }
        }
    }
}

/// Hourly retention pass over sync_log. Queue rows are left for the
/// operator's reaper.
async fn cleanup_loop<S: SyncStore>(
    store: Arc<S>,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(3600));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match store.cleanup_sync_log(retention).await {
                    Ok(pruned) => debug!(pruned, "sync_log cleanup done"),
                    Err(e) => warn!(error = %e, "sync_log cleanup failed"),
                }
            }
        }
    }
}

/// Queue depth gauge, backlog batch widening, and pair pausing.
async fn watchdog_loop<S: SyncStore>(
    store: Arc<S>,
    metrics: Arc<Metrics>,
    healths: Vec<(String, Arc<PairHealth>)>,
    batch_size: Arc<AtomicI64>,
    settings: EngineSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut alarm_since: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                match store.queue_stats().await {
                    Ok(stats) => {
                        metrics.set_queue_stats(&stats);
                        let depth = stats.pending;

                        if depth > settings.queue_alarm_depth {
                            let since = *alarm_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= Duration::from_secs(60)
                                && batch_size.load(Ordering::Relaxed) < settings.batch_cap
                            {
                                batch_size.store(settings.batch_cap, Ordering::Relaxed);
                                warn!(
                                    depth,
                                    batch = settings.batch_cap,
                                    "Queue backlog sustained, widening claim batch"
                                );
                            }
                        } else {
                            alarm_since = None;
                            if batch_size.load(Ordering::Relaxed) != settings.batch_size {
                                batch_size.store(settings.batch_size, Ordering::Relaxed);
                                info!(depth, "Queue backlog cleared, batch size restored");
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Queue stats check failed"),
                }

                for (name, health) in &healths {
                    if health.is_paused() {
                        continue;
                    }
                    metrics.clear_paused(name);

                    if let Some(rate) = health.failure_rate() {
                        if rate > settings.pause_on_error_rate {
                            health.pause(settings.pause_for);
                            let reason = format!("failure rate {:.2}", rate);
                            metrics.set_paused(name, &reason);
                            warn!(
                                pair = %name,
                                rate,
                                pause_s = settings.pause_for.as_secs(),
                                "Failure rate over threshold, pausing pair"
                            );
                        }
                    }
                }
            }
        }
    }
}

//! Rolling statistics window
//!
//! A [`Stats`] owns a fixed ring of [`Bucket`]s covering the most recent
//! `bucket_num * bucket_span` of traffic. The last bucket is the active
//! one; a rotation timer appends a fresh bucket and drops the oldest, so a
//! bucket is never mutated after it leaves the active slot. A second timer
//! publishes latency-inclusive snapshots every `stat_interval`.
//!
//! Both timers run as detached tasks on the ambient tokio runtime. They
//! never keep the process alive: when the runtime shuts down they die with
//! it, and when no runtime is present at construction they are simply not
//! started (recording and aggregation still work).

use crate::bucket::{Bucket, CumulativeStats};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Broadcast capacity for the update and snapshot feeds
const CHANNEL_CAPACITY: usize = 64;

/// Window shape and publication cadence. Immutable after construction.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Rotation period of the ring
    pub bucket_span: Duration,
    /// Number of buckets in the ring
    pub bucket_num: usize,
    /// Snapshot publication period
    pub stat_interval: Duration,
    /// Percentiles computed per snapshot, each in `[0, 1]`
    pub percentiles: Vec<f64>,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            bucket_span: Duration::from_millis(1000),
            bucket_num: 60,
            stat_interval: Duration::from_millis(1200),
            percentiles: vec![0.0, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 0.995, 1.0],
        }
    }
}

/// One published aggregate over the current window
///
/// `percentiles` is keyed by the fractional percentile rendered as a
/// string (`"0"`, `"0.25"`, …, `"1"`). The lifetime counters are flattened
/// alongside the window sums on the wire. Raw latency samples never leave
/// the window.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TotalStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub short_circuited: u64,
    /// Rounded mean of the window's latency samples, in ms
    pub latency_mean: u64,
    pub percentiles: BTreeMap<String, u64>,
    #[serde(flatten)]
    pub lifetime: CumulativeStats,
}

enum Outcome {
    Success(u64),
    Failure(u64),
    Timeout(u64),
    ShortCircuit,
}

struct Window {
    buckets: VecDeque<Bucket>,
    lifetime: CumulativeStats,
    totals: TotalStats,
}

impl Window {
    fn new(bucket_num: usize) -> Self {
        let mut buckets = VecDeque::with_capacity(bucket_num);
        for _ in 0..bucket_num {
            buckets.push_back(Bucket::new());
        }
        Self {
            buckets,
            lifetime: CumulativeStats::default(),
            totals: TotalStats::default(),
        }
    }

    fn record(&mut self, outcome: Outcome) {
        let Window {
            buckets, lifetime, ..
        } = self;
        let active = buckets
            .back_mut()
            .expect("window always holds at least one bucket");
        match outcome {
            Outcome::Success(run_time) => active.success(run_time, lifetime),
            Outcome::Failure(run_time) => active.failure(run_time, lifetime),
            Outcome::Timeout(run_time) => active.timeout(run_time, lifetime),
            Outcome::ShortCircuit => active.short_circuit(lifetime),
        }
    }

    /// Sum the window and store the result as the new published aggregate.
    ///
    /// Without `include_latency` the previous `latency_mean`/`percentiles`
    /// are carried over unchanged, even when the window is empty.
    fn generate(&mut self, cfg: &StatsConfig, include_latency: bool) -> TotalStats {
        let mut totals = TotalStats {
            latency_mean: self.totals.latency_mean,
            percentiles: self.totals.percentiles.clone(),
            lifetime: self.lifetime,
            ..TotalStats::default()
        };
        for bucket in &self.buckets {
            totals.total += bucket.total;
            totals.successful += bucket.successful;
            totals.failed += bucket.failed;
            totals.timed_out += bucket.timed_out;
            totals.short_circuited += bucket.short_circuited;
        }
        if include_latency {
            let mut samples: Vec<u64> = self
                .buckets
                .iter()
                .flat_map(|b| b.request_times.iter().copied())
                .collect();
            samples.sort_unstable();
            totals.latency_mean = latency_mean(&samples);
            totals.percentiles = cfg
                .percentiles
                .iter()
                .map(|&p| (percentile_key(p), percentile(p, &samples)))
                .collect();
        }
        self.totals = totals.clone();
        totals
    }
}

struct StatsInner {
    cfg: StatsConfig,
    window: Mutex<Window>,
    update_tx: broadcast::Sender<TotalStats>,
    snapshot_tx: broadcast::Sender<TotalStats>,
    rotation: Mutex<Option<JoinHandle<()>>>,
    snapshots: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StatsInner {
    fn drop(&mut self) {
        if let Some(handle) = self.rotation.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.snapshots.lock().take() {
            handle.abort();
        }
    }
}

/// Rolling window of outcome buckets with periodic aggregation
///
/// Clone freely; all clones share the same window.
#[derive(Clone)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

impl Stats {
    /// Create a window and start the rotation timer.
    ///
    /// Percentiles are clamped to `[0, 1]`, sorted, and deduplicated. The
    /// snapshot timer is not started here; see [`Stats::start_snapshots`].
    ///
    /// # Panics
    ///
    /// Panics if `bucket_num` is 0 or either period is zero.
    pub fn new(cfg: StatsConfig) -> Self {
        assert!(cfg.bucket_num > 0, "bucket_num must be greater than 0");
        assert!(
            !cfg.bucket_span.is_zero() && !cfg.stat_interval.is_zero(),
            "timer periods must be non-zero"
        );
        let mut cfg = cfg;
        cfg.percentiles = normalize_percentiles(cfg.percentiles);

        let mut window = Window::new(cfg.bucket_num);
        window.generate(&cfg, true);

        let (update_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (snapshot_tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        let stats = Self {
            inner: Arc::new(StatsInner {
                cfg,
                window: Mutex::new(window),
                update_tx,
                snapshot_tx,
                rotation: Mutex::new(None),
                snapshots: Mutex::new(None),
            }),
        };
        stats.start_rotation();
        stats
    }

    pub fn config(&self) -> &StatsConfig {
        &self.inner.cfg
    }

    /// Record a successful call and publish an update.
    pub fn success(&self, run_time: u64) -> TotalStats {
        self.record(Outcome::Success(run_time))
    }

    /// Record a failed call and publish an update.
    pub fn failure(&self, run_time: u64) -> TotalStats {
        self.record(Outcome::Failure(run_time))
    }

    /// Record a timed-out call and publish an update.
    pub fn timeout(&self, run_time: u64) -> TotalStats {
        self.record(Outcome::Timeout(run_time))
    }

    /// Record a short-circuited call and publish an update.
    pub fn short_circuit(&self) -> TotalStats {
        self.record(Outcome::ShortCircuit)
    }

    fn record(&self, outcome: Outcome) -> TotalStats {
        let mut window = self.inner.window.lock();
        window.record(outcome);
        let totals = window.generate(&self.inner.cfg, false);
        let _ = self.inner.update_tx.send(totals.clone());
        totals
    }

    /// The last published aggregate.
    pub fn totals(&self) -> TotalStats {
        self.inner.window.lock().totals.clone()
    }

    /// The lifetime counters as of now.
    pub fn lifetime(&self) -> CumulativeStats {
        self.inner.window.lock().lifetime
    }

    /// Aggregate with latency, publish a snapshot, then zero the
    /// per-interval derivative counters. The published value carries the
    /// derivatives accumulated since the previous snapshot.
    pub fn snapshot_now(&self) -> TotalStats {
        let mut window = self.inner.window.lock();
        let totals = window.generate(&self.inner.cfg, true);
        let _ = self.inner.snapshot_tx.send(totals.clone());
        window.lifetime.reset_derivs();
        totals
    }

    /// Replace every bucket with a fresh one and publish an update.
    ///
    /// Lifetime counters are kept. The update is computed without latency,
    /// so an all-empty window republishes the previous latency figures.
    pub fn reset(&self) -> TotalStats {
        let mut window = self.inner.window.lock();
        let bucket_num = window.buckets.len();
        window.buckets.clear();
        for _ in 0..bucket_num {
            window.buckets.push_back(Bucket::new());
        }
        let totals = window.generate(&self.inner.cfg, false);
        let _ = self.inner.update_tx.send(totals.clone());
        totals
    }

    /// Receive a [`TotalStats`] after every recorded outcome (and reset).
    pub fn subscribe_updates(&self) -> broadcast::Receiver<TotalStats> {
        self.inner.update_tx.subscribe()
    }

    /// Receive the latency-inclusive aggregate at every snapshot.
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<TotalStats> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Start the snapshot timer. No-op when already running or when no
    /// tokio runtime is available.
    pub fn start_snapshots(&self) {
        let mut slot = self.inner.snapshots.lock();
        if slot.is_some() {
            return;
        }
        let stats = self.clone();
        let period = self.inner.cfg.stat_interval;
        *slot = crate::try_spawn(async move {
            let mut tick = tokio::time::interval(period);
            // the first tick of a tokio interval resolves immediately
            tick.tick().await;
            loop {
                tick.tick().await;
                stats.snapshot_now();
            }
        });
    }

    fn start_rotation(&self) {
        let mut slot = self.inner.rotation.lock();
        if slot.is_some() {
            return;
        }
        let stats = self.clone();
        let period = self.inner.cfg.bucket_span;
        *slot = crate::try_spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                stats.rotate();
            }
        });
    }

    /// Advance the ring by one bucket. Driven by the rotation timer.
    fn rotate(&self) {
        let mut window = self.inner.window.lock();
        window.buckets.push_back(Bucket::new());
        window.buckets.pop_front();
    }

    /// Stop the rotation timer. Returns whether a timer was cancelled.
    pub fn stop_rotation(&self) -> bool {
        match self.inner.rotation.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop the snapshot timer. Returns whether a timer was cancelled.
    pub fn stop_snapshots(&self) -> bool {
        match self.inner.snapshots.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stats")
            .field("cfg", &self.inner.cfg)
            .field("totals", &self.inner.window.lock().totals)
            .finish()
    }
}

fn normalize_percentiles(percentiles: Vec<f64>) -> Vec<f64> {
    let mut out: Vec<f64> = percentiles
        .into_iter()
        .map(|p| p.clamp(0.0, 1.0))
        .collect();
    out.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    out.dedup();
    out
}

/// Render a fractional percentile as its map key (`0.25` → `"0.25"`).
pub(crate) fn percentile_key(p: f64) -> String {
    format!("{}", p)
}

/// Exact percentile rule: `p == 0` yields the minimum, otherwise the
/// element at `ceil(p * n)` (1-based). Empty input yields 0.
pub(crate) fn percentile(p: f64, sorted: &[u64]) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    if p <= 0.0 {
        return sorted[0];
    }
    let idx = ((p * sorted.len() as f64).ceil() as usize).clamp(1, sorted.len());
    sorted[idx - 1]
}

/// Rounded mean, 0 for an empty slice.
pub(crate) fn latency_mean(samples: &[u64]) -> u64 {
    if samples.is_empty() {
        return 0;
    }
    let sum: u64 = samples.iter().sum();
    (sum as f64 / samples.len() as f64).round() as u64
}

//! Breaker state machine and coordination
//!
//! A [`Breaker`] owns one [`Stats`] window and the open/closed state that
//! gates every circuit bound to it. The threshold check runs on every
//! recorded outcome; opening bumps a generation counter so results still in
//! flight from the previous generation cannot bias the fresh window.
//! Healing happens through a recurring health probe when one is
//! configured, otherwise through a one-shot cooldown.
//!
//! All timers are detached tokio tasks: they never keep the host process
//! alive, and they are cancelled by [`Breaker::destroy`] or when the
//! runtime shuts down.

use crate::builder::BreakerBuilder;
use crate::circuit::OpFuture;
use crate::events::{BreakerEvent, Callbacks};
use crate::registry::GlobalRegistry;
use crate::stats::{Stats, StatsConfig, TotalStats};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broadcast capacity of the breaker event feed
const EVENT_CAPACITY: usize = 64;

/// Boxed error type for health probes
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Type alias for health probe functions
pub type HealthCheckFn = Arc<dyn Fn() -> OpFuture<(), BoxError> + Send + Sync>;

/// Breaker thresholds and timing
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Identifier used in errors and snapshots
    pub name: String,
    /// Dashboard grouping key
    pub group: String,
    /// Minimum success ratio; below it the breaker opens
    pub threshold: f64,
    /// Window total that must be exceeded (strictly) before the ratio is
    /// consulted
    pub wait_threshold: u64,
    /// Cooldown before closing again when no health check is configured
    pub circuit_duration: Duration,
    /// Default per-exec deadline
    pub timeout: Duration,
    /// Health probe period
    pub health_check_interval: Duration,
    /// Prefix surfaced errors with `[Breaker: <name>] `
    pub modify_error: bool,
    /// Register with the process-wide registry on construction
    pub register_global: bool,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            name: "defaultBrake".to_string(),
            group: "defaultBrakeGroup".to_string(),
            threshold: 0.5,
            wait_threshold: 100,
            circuit_duration: Duration::from_millis(30_000),
            timeout: Duration::from_millis(15_000),
            health_check_interval: Duration::from_millis(5_000),
            modify_error: true,
            register_global: true,
        }
    }
}

/// One published snapshot, wrapped with breaker metadata
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEnvelope {
    pub name: String,
    pub group: String,
    /// Epoch milliseconds at publication
    pub time: u64,
    pub open: bool,
    /// Cooldown in ms
    pub circuit_duration: u64,
    pub threshold: f64,
    pub wait_threshold: u64,
    pub stats: TotalStats,
}

struct BreakerState {
    open: bool,
    generation: u64,
    /// Healing timer: the probe loop or the cooldown one-shot. Scheduled
    /// exactly while open.
    heal: Option<JoinHandle<()>>,
}

pub(crate) struct BreakerInner {
    id: u64,
    cfg: BreakerConfig,
    stats: Stats,
    health_check: Option<HealthCheckFn>,
    state: Mutex<BreakerState>,
    callbacks: Callbacks,
    events_tx: broadcast::Sender<BreakerEvent>,
    snapshot_pump: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl Drop for BreakerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.snapshot_pump.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.state.lock().heal.take() {
            handle.abort();
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

enum OutcomeKind {
    Success,
    Failure,
    Timeout,
}

/// Coordinates one statistics window, the open/closed state, and healing
///
/// Clone freely; all clones share the same state. Wrap operations with
/// [`Breaker::circuit`] and execute through the returned
/// [`Circuit`](crate::Circuit).
#[derive(Clone)]
pub struct Breaker {
    inner: Arc<BreakerInner>,
}

impl Breaker {
    /// Start building a breaker.
    pub fn builder() -> BreakerBuilder {
        BreakerBuilder::new()
    }

    pub(crate) fn assemble(
        cfg: BreakerConfig,
        stats_cfg: StatsConfig,
        health_check: Option<HealthCheckFn>,
        callbacks: Callbacks,
    ) -> Self {
        let stats = Stats::new(stats_cfg);
        stats.start_snapshots();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let breaker = Self {
            inner: Arc::new(BreakerInner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                cfg,
                stats,
                health_check,
                state: Mutex::new(BreakerState {
                    open: false,
                    generation: 1,
                    heal: None,
                }),
                callbacks,
                events_tx,
                snapshot_pump: Mutex::new(None),
                destroyed: AtomicBool::new(false),
            }),
        };
        breaker.start_snapshot_pump();
        if breaker.inner.cfg.register_global {
            GlobalRegistry::global().register(&breaker);
        }
        breaker
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.cfg.name
    }

    pub fn group(&self) -> &str {
        &self.inner.cfg.group
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.inner.cfg
    }

    /// The statistics window this breaker records into.
    pub fn stats(&self) -> Stats {
        self.inner.stats.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// `"Open"` or `"Closed"`.
    pub fn state_name(&self) -> &'static str {
        if self.is_open() {
            "Open"
        } else {
            "Closed"
        }
    }

    /// The current generation tag. Starts at 1 and increases by one on
    /// every closed → open transition.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Receive every [`BreakerEvent`] this breaker emits.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Publish a snapshot immediately and return its envelope.
    pub fn snapshot_now(&self) -> SnapshotEnvelope {
        let totals = self.inner.stats.snapshot_now();
        self.envelope(totals)
    }

    /// Force the breaker open regardless of the current statistics.
    pub fn trip(&self) {
        let opened = {
            let mut state = self.inner.state.lock();
            self.transition_open(&mut state)
        };
        if opened {
            self.announce_open();
        }
    }

    /// Tear the breaker down: deregister from the global registry, stop
    /// the statistics timers, and cancel the healing timer and snapshot
    /// forwarding. Idempotent. Existing circuits keep executing, but
    /// nothing reaches deregistered listeners anymore.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        GlobalRegistry::global().deregister(self);
        self.inner.stats.stop_rotation();
        self.inner.stats.stop_snapshots();
        if let Some(handle) = self.inner.snapshot_pump.lock().take() {
            handle.abort();
        }
        if let Some(handle) = self.inner.state.lock().heal.take() {
            handle.abort();
        }
        debug!(breaker = %self.inner.cfg.name, "breaker destroyed");
    }

    // --- recording (called by circuits) ---

    pub(crate) fn emit(&self, event: BreakerEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    pub(crate) fn emit_exec(&self) {
        self.emit(BreakerEvent::Exec);
    }

    pub(crate) fn on_success(&self, elapsed_ms: u64, generation: u64) {
        self.record_outcome(OutcomeKind::Success, elapsed_ms, generation);
    }

    pub(crate) fn on_failure(&self, elapsed_ms: u64, generation: u64) {
        self.record_outcome(OutcomeKind::Failure, elapsed_ms, generation);
    }

    pub(crate) fn on_timeout(&self, elapsed_ms: u64, generation: u64) {
        self.record_outcome(OutcomeKind::Timeout, elapsed_ms, generation);
    }

    /// Record a rejected call. Returns the fresh aggregate so the caller
    /// can build the circuit-open error from it.
    pub(crate) fn record_short_circuit(&self) -> TotalStats {
        let totals = {
            let _state = self.inner.state.lock();
            self.inner.stats.short_circuit()
        };
        self.emit(BreakerEvent::ShortCircuit);
        totals
    }

    /// Record one outcome under the breaker mutex: the generation filter,
    /// the stats increment, and the threshold check form one compound so
    /// no rotation or concurrent recording can interleave.
    fn record_outcome(&self, kind: OutcomeKind, elapsed_ms: u64, generation: u64) {
        let opened = {
            let mut state = self.inner.state.lock();
            if generation != state.generation {
                debug!(
                    breaker = %self.inner.cfg.name,
                    generation,
                    current = state.generation,
                    "dropping stale outcome"
                );
                false
            } else {
                let totals = match kind {
                    OutcomeKind::Success => self.inner.stats.success(elapsed_ms),
                    OutcomeKind::Failure => self.inner.stats.failure(elapsed_ms),
                    OutcomeKind::Timeout => self.inner.stats.timeout(elapsed_ms),
                };
                self.maybe_open(&mut state, &totals)
            }
        };
        // The event is observable even when the stats filter dropped the
        // outcome; only the window is generation-gated.
        self.emit(match kind {
            OutcomeKind::Success => BreakerEvent::Success { elapsed_ms },
            OutcomeKind::Failure => BreakerEvent::Failure {
                elapsed_ms,
                generation,
            },
            OutcomeKind::Timeout => BreakerEvent::Timeout {
                elapsed_ms,
                generation,
            },
        });
        if opened {
            self.announce_open();
        }
    }

    /// The threshold check, run against every fresh aggregate.
    ///
    /// `total` must exceed `wait_threshold` strictly, so with the defaults
    /// the 101st request is the first that can trip the breaker. Short
    /// circuits do not count toward `total`, so an open breaker cannot
    /// re-trip itself.
    fn maybe_open(&self, state: &mut BreakerState, totals: &TotalStats) -> bool {
        if totals.total > self.inner.cfg.wait_threshold
            && !state.open
            && (totals.successful as f64 / totals.total as f64) < self.inner.cfg.threshold
        {
            self.transition_open(state)
        } else {
            false
        }
    }

    fn transition_open(&self, state: &mut BreakerState) -> bool {
        if state.open {
            return false;
        }
        state.open = true;
        state.generation += 1;
        state.heal = self.spawn_heal();
        true
    }

    fn announce_open(&self) {
        warn!(breaker = %self.inner.cfg.name, "circuit opened");
        self.inner.callbacks.trigger_open(&self.inner.cfg.name);
        self.emit(BreakerEvent::CircuitOpen);
    }

    // --- healing ---

    fn spawn_heal(&self) -> Option<JoinHandle<()>> {
        let breaker = self.clone();
        match &self.inner.health_check {
            Some(check) => {
                let check = check.clone();
                let period = self.inner.cfg.health_check_interval;
                crate::try_spawn(async move { breaker.probe_loop(check, period).await })
            }
            None => {
                let cooldown = self.inner.cfg.circuit_duration;
                crate::try_spawn(async move {
                    tokio::time::sleep(cooldown).await;
                    breaker.heal();
                })
            }
        }
    }

    async fn probe_loop(&self, check: HealthCheckFn, period: Duration) {
        let mut tick = tokio::time::interval(period);
        tick.tick().await;
        loop {
            tick.tick().await;
            if !self.is_open() {
                // raced shut by something else; stop probing
                break;
            }
            match check().await {
                Ok(()) => {
                    self.heal();
                    break;
                }
                Err(err) => {
                    warn!(
                        breaker = %self.inner.cfg.name,
                        error = %err,
                        "health check failed"
                    );
                    self.emit(BreakerEvent::HealthCheckFailed {
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// Reset the window and close. The reset comes first so the breaker
    /// reopens only on fresh traffic.
    fn heal(&self) {
        if !self.is_open() {
            return;
        }
        self.inner.stats.reset();
        self.close();
    }

    fn close(&self) {
        let closed = {
            let mut state = self.inner.state.lock();
            if !state.open {
                false
            } else {
                state.open = false;
                if let Some(handle) = state.heal.take() {
                    handle.abort();
                }
                true
            }
        };
        if closed {
            info!(breaker = %self.inner.cfg.name, "circuit closed");
            self.inner.callbacks.trigger_close(&self.inner.cfg.name);
            self.emit(BreakerEvent::CircuitClosed);
        }
    }

    fn envelope(&self, stats: TotalStats) -> SnapshotEnvelope {
        SnapshotEnvelope {
            name: self.inner.cfg.name.clone(),
            group: self.inner.cfg.group.clone(),
            time: epoch_ms(),
            open: self.is_open(),
            circuit_duration: self.inner.cfg.circuit_duration.as_millis() as u64,
            threshold: self.inner.cfg.threshold,
            wait_threshold: self.inner.cfg.wait_threshold,
            stats,
        }
    }

    fn start_snapshot_pump(&self) {
        let mut slot = self.inner.snapshot_pump.lock();
        if slot.is_some() {
            return;
        }
        let breaker = self.clone();
        let mut rx = self.inner.stats.subscribe_snapshots();
        *slot = crate::try_spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(totals) => {
                        let envelope = breaker.envelope(totals);
                        breaker.emit(BreakerEvent::Snapshot(envelope));
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl std::fmt::Debug for Breaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Breaker")
            .field("name", &self.inner.cfg.name)
            .field("open", &state.open)
            .field("generation", &state.generation)
            .finish()
    }
}

fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn quick_breaker(wait_threshold: u64, threshold: f64) -> Breaker {
        Breaker::builder()
            .name("test")
            .wait_threshold(wait_threshold)
            .threshold(threshold)
            .register_global(false)
            .build()
    }

    fn drain(rx: &mut broadcast::Receiver<BreakerEvent>) -> Vec<BreakerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_defaults() {
        let breaker = Breaker::builder().register_global(false).build();

        assert_eq!(breaker.name(), "defaultBrake");
        assert_eq!(breaker.group(), "defaultBrakeGroup");
        assert!(!breaker.is_open());
        assert_eq!(breaker.state_name(), "Closed");
        assert_eq!(breaker.generation(), 1);
        assert_eq!(breaker.config().wait_threshold, 100);
        assert_eq!(breaker.config().threshold, 0.5);
        assert_eq!(breaker.config().timeout, Duration::from_millis(15_000));
    }

    #[tokio::test]
    async fn test_opens_when_threshold_tripped() {
        let breaker = quick_breaker(4, 0.5);
        let mut rx = breaker.subscribe();

        breaker.on_success(10, 1);
        breaker.on_failure(10, 1);
        breaker.on_failure(10, 1);
        breaker.on_failure(10, 1);
        assert!(!breaker.is_open(), "total == wait_threshold stays closed");

        breaker.on_failure(10, 1);
        assert!(breaker.is_open(), "5th event trips: ratio 0.2 < 0.5");
        assert_eq!(breaker.generation(), 2);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BreakerEvent::CircuitOpen)));
        assert!(!events
            .iter()
            .any(|e| matches!(e, BreakerEvent::CircuitClosed)));
    }

    #[tokio::test]
    async fn test_never_opens_at_or_below_wait_threshold() {
        let breaker = quick_breaker(4, 0.5);
        for _ in 0..4 {
            breaker.on_failure(10, 1);
        }
        assert!(!breaker.is_open());
        assert_eq!(breaker.generation(), 1);
    }

    #[tokio::test]
    async fn test_healthy_traffic_never_opens() {
        let breaker = quick_breaker(4, 0.5);
        for _ in 0..50 {
            breaker.on_success(10, 1);
        }
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_stale_generation_outcome_is_dropped() {
        let breaker = quick_breaker(4, 0.5);
        breaker.trip();
        assert_eq!(breaker.generation(), 2);

        let mut rx = breaker.subscribe();
        breaker.on_failure(10, 1);

        let lifetime = breaker.stats().lifetime();
        assert_eq!(lifetime.count_failure, 0, "stale outcome must not count");
        assert_eq!(lifetime.count_total, 0);

        // The event itself is still observable; only the window is gated
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BreakerEvent::Failure { generation: 1, .. })));
    }

    #[tokio::test]
    async fn test_current_generation_outcome_counts_after_reopen() {
        let breaker = quick_breaker(4, 0.5);
        breaker.trip();

        breaker.on_failure(10, 2);
        assert_eq!(breaker.stats().lifetime().count_failure, 1);
    }

    #[tokio::test]
    async fn test_short_circuit_accounting() {
        let breaker = quick_breaker(4, 0.5);
        breaker.trip();

        for _ in 0..10 {
            breaker.record_short_circuit();
        }

        let lifetime = breaker.stats().lifetime();
        assert_eq!(lifetime.count_short_circuited, 10);
        assert_eq!(lifetime.count_total, 0);
        assert_eq!(breaker.stats().totals().total, 0);
        assert!(breaker.is_open(), "short circuits cannot re-trip or close");
    }

    #[tokio::test]
    async fn test_trip_is_idempotent() {
        let breaker = quick_breaker(4, 0.5);
        let mut rx = breaker.subscribe();

        breaker.trip();
        breaker.trip();

        assert_eq!(breaker.generation(), 2, "second trip is a no-op");
        let opens = drain(&mut rx)
            .iter()
            .filter(|e| matches!(e, BreakerEvent::CircuitOpen))
            .count();
        assert_eq!(opens, 1);
    }

    #[tokio::test]
    async fn test_cooldown_heals_and_resets_window() {
        let breaker = Breaker::builder()
            .name("test")
            .wait_threshold(1)
            .threshold(0.5)
            .circuit_duration(Duration::from_millis(40))
            .register_global(false)
            .build();
        let mut rx = breaker.subscribe();

        breaker.on_failure(10, 1);
        breaker.on_failure(10, 1);
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!breaker.is_open(), "cooldown should close the breaker");
        assert_eq!(breaker.stats().totals().total, 0, "window reset on close");
        assert_eq!(breaker.stats().lifetime().count_failure, 2);

        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, BreakerEvent::CircuitClosed)));
    }

    #[tokio::test]
    async fn test_health_check_heals_on_second_probe() {
        use std::sync::atomic::AtomicU64;

        let attempts = Arc::new(AtomicU64::new(0));
        let probe_attempts = attempts.clone();

        let breaker = Breaker::builder()
            .name("test")
            .health_check(move || {
                let n = probe_attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err::<(), BoxError>("dependency still down".into())
                    } else {
                        Ok(())
                    }
                }
            })
            .health_check_interval(Duration::from_millis(25))
            .register_global(false)
            .build();
        let mut rx = breaker.subscribe();

        breaker.trip();

        // Wait for the second probe to land
        let mut waited = Duration::ZERO;
        while breaker.is_open() && waited < Duration::from_millis(1000) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }

        assert!(!breaker.is_open(), "second probe should heal");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let events = drain(&mut rx);
        let failed = events
            .iter()
            .filter(|e| matches!(e, BreakerEvent::HealthCheckFailed { .. }))
            .count();
        assert_eq!(failed, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, BreakerEvent::CircuitClosed)));
    }

    #[tokio::test]
    async fn test_generation_increases_across_reopens() {
        let breaker = Breaker::builder()
            .name("test")
            .wait_threshold(1)
            .circuit_duration(Duration::from_millis(30))
            .register_global(false)
            .build();

        breaker.on_failure(10, 1);
        breaker.on_failure(10, 1);
        assert_eq!(breaker.generation(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!breaker.is_open());

        breaker.on_failure(10, 2);
        breaker.on_failure(10, 2);
        assert_eq!(breaker.generation(), 3, "each reopen bumps the generation");
    }

    #[tokio::test]
    async fn test_snapshot_envelope_fields() {
        let breaker = Breaker::builder()
            .name("api")
            .group("edge")
            .register_global(false)
            .build();

        let envelope = breaker.snapshot_now();
        assert_eq!(envelope.name, "api");
        assert_eq!(envelope.group, "edge");
        assert!(!envelope.open);
        assert!(envelope.time > 0);
        assert_eq!(envelope.circuit_duration, 30_000);
        assert_eq!(envelope.wait_threshold, 100);

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["waitThreshold"], 100);
        assert_eq!(json["circuitDuration"], 30_000);
        assert_eq!(json["open"], false);
    }

    #[tokio::test]
    async fn test_snapshot_event_reaches_the_feed() {
        let breaker = Breaker::builder()
            .name("api")
            .stat_interval(Duration::from_millis(30))
            .register_global(false)
            .build();
        let mut rx = breaker.subscribe();
        breaker.stats().success(10);

        let envelope = tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                if let Ok(BreakerEvent::Snapshot(envelope)) = rx.recv().await {
                    return envelope;
                }
            }
        })
        .await
        .expect("snapshot event within 500ms");

        assert_eq!(envelope.name, "api");
        assert_eq!(envelope.stats.lifetime.count_success, 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_stops_timers() {
        let breaker = Breaker::builder().name("doomed").build();
        assert!(GlobalRegistry::global().contains(&breaker));

        breaker.destroy();
        assert!(!GlobalRegistry::global().contains(&breaker));

        // Second destroy is a no-op, and the stats timers are gone
        breaker.destroy();
        assert!(!breaker.stats().stop_rotation());
        assert!(!breaker.stats().stop_snapshots());

        // Recording still works after destroy
        breaker.on_success(5, 1);
        assert_eq!(breaker.stats().lifetime().count_success, 1);
    }
}

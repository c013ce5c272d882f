//! Process-wide breaker registry and dashboard feed
//!
//! Registered breakers have their snapshot events multiplexed onto a raw
//! broadcast feed of [`SnapshotEnvelope`]s. A transform task consumes the
//! raw feed, maps each envelope to the dashboard document, and emits it as
//! server-sent-event-framed text (`data: <json>\n\n`).

use crate::breaker::{Breaker, SnapshotEnvelope};
use crate::events::BreakerEvent;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Broadcast capacity of the raw and dashboard feeds
const FEED_CAPACITY: usize = 256;

struct Registration {
    id: u64,
    name: String,
    forwarder: Option<JoinHandle<()>>,
}

/// Registry of live breakers with a multiplexed snapshot feed
///
/// Most callers want the process-wide instance from
/// [`GlobalRegistry::global`]; breakers register themselves there unless
/// built with `register_global(false)`. Separate instances can be created
/// for isolation (tests, embedded setups).
pub struct GlobalRegistry {
    breakers: Mutex<Vec<Registration>>,
    raw_tx: broadcast::Sender<SnapshotEnvelope>,
    sse_tx: broadcast::Sender<String>,
    transform: Mutex<Option<JoinHandle<()>>>,
}

static GLOBAL: OnceLock<GlobalRegistry> = OnceLock::new();

impl GlobalRegistry {
    /// The process-wide registry.
    pub fn global() -> &'static GlobalRegistry {
        GLOBAL.get_or_init(GlobalRegistry::new)
    }

    pub fn new() -> Self {
        let (raw_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (sse_tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            breakers: Mutex::new(Vec::new()),
            raw_tx,
            sse_tx,
            transform: Mutex::new(None),
        }
    }

    /// Add a breaker and forward its snapshots onto the raw feed.
    /// Registering the same breaker twice is a no-op.
    pub fn register(&self, breaker: &Breaker) {
        let mut list = self.breakers.lock();
        if list.iter().any(|r| r.id == breaker.id()) {
            return;
        }
        let raw_tx = self.raw_tx.clone();
        let mut rx = breaker.subscribe();
        let forwarder = crate::try_spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(BreakerEvent::Snapshot(envelope)) => {
                        let _ = raw_tx.send(envelope);
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        debug!(breaker = %breaker.name(), "registered breaker");
        list.push(Registration {
            id: breaker.id(),
            name: breaker.name().to_string(),
            forwarder,
        });
    }

    /// Remove a breaker and stop forwarding its snapshots.
    pub fn deregister(&self, breaker: &Breaker) {
        let mut list = self.breakers.lock();
        if let Some(pos) = list.iter().position(|r| r.id == breaker.id()) {
            let registration = list.remove(pos);
            if let Some(handle) = registration.forwarder {
                handle.abort();
            }
            debug!(breaker = %registration.name, "deregistered breaker");
        }
    }

    pub fn contains(&self, breaker: &Breaker) -> bool {
        self.breakers.lock().iter().any(|r| r.id == breaker.id())
    }

    /// Number of currently registered breakers.
    pub fn instance_count(&self) -> usize {
        self.breakers.lock().len()
    }

    /// Receive every registered breaker's snapshot envelopes.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<SnapshotEnvelope> {
        self.raw_tx.subscribe()
    }

    /// Receive SSE-framed dashboard documents
    /// (`data: <json>\n\n` per snapshot).
    pub fn subscribe_dashboard(&self) -> broadcast::Receiver<String> {
        self.ensure_transform();
        self.sse_tx.subscribe()
    }

    fn ensure_transform(&self) {
        let mut slot = self.transform.lock();
        if slot.is_some() {
            return;
        }
        let mut rx = self.raw_tx.subscribe();
        let sse_tx = self.sse_tx.clone();
        *slot = crate::try_spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        let metrics = DashboardMetrics::from_envelope(&envelope);
                        match metrics.sse_frame() {
                            Ok(frame) => {
                                let _ = sse_tx.send(frame);
                            }
                            Err(err) => {
                                warn!(error = %err, "failed to serialise dashboard metrics");
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

impl Default for GlobalRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GlobalRegistry {
    fn drop(&mut self) {
        for registration in self.breakers.lock().drain(..) {
            if let Some(handle) = registration.forwarder {
                handle.abort();
            }
        }
        if let Some(handle) = self.transform.lock().take() {
            handle.abort();
        }
    }
}

/// One snapshot mapped to the dashboard document shape
///
/// The latency tables are keyed by integer percentile labels translated
/// from the envelope's fractional keys (`"0.995"` → `"99.5"`). Configured
/// percentile sets missing a canonical label leave a hole, not a zero.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardMetrics {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: String,
    pub group: String,
    #[serde(rename = "currentTime")]
    pub current_time: u64,
    #[serde(rename = "isCircuitBreakerOpen")]
    pub is_circuit_breaker_open: bool,
    #[serde(rename = "errorPercentage")]
    pub error_percentage: u64,
    #[serde(rename = "errorCount")]
    pub error_count: u64,
    #[serde(rename = "requestCount")]
    pub request_count: u64,
    #[serde(rename = "rollingCountSuccess")]
    pub rolling_count_success: u64,
    #[serde(rename = "rollingCountFailure")]
    pub rolling_count_failure: u64,
    #[serde(rename = "rollingCountTimeout")]
    pub rolling_count_timeout: u64,
    #[serde(rename = "rollingCountShortCircuited")]
    pub rolling_count_short_circuited: u64,
    #[serde(rename = "latencyExecute_mean")]
    pub latency_execute_mean: u64,
    #[serde(rename = "latencyExecute")]
    pub latency_execute: BTreeMap<String, u64>,
    #[serde(rename = "latencyTotal_mean")]
    pub latency_total_mean: u64,
    #[serde(rename = "latencyTotal")]
    pub latency_total: BTreeMap<String, u64>,
    #[serde(rename = "propertyValue_circuitBreakerRequestVolumeThreshold")]
    pub request_volume_threshold: u64,
    #[serde(rename = "propertyValue_circuitBreakerErrorThresholdPercentage")]
    pub error_threshold_percentage: u64,
    #[serde(rename = "propertyValue_circuitBreakerSleepWindowInMilliseconds")]
    pub sleep_window_ms: u64,
    #[serde(rename = "reportingHosts")]
    pub reporting_hosts: u32,
}

impl DashboardMetrics {
    pub fn from_envelope(envelope: &SnapshotEnvelope) -> Self {
        let stats = &envelope.stats;
        let error_percentage = if stats.total == 0 {
            0
        } else {
            ((1.0 - stats.successful as f64 / stats.total as f64) * 100.0).round() as u64
        };
        let latency: BTreeMap<String, u64> = stats
            .percentiles
            .iter()
            .map(|(key, value)| (percentile_label(key), *value))
            .collect();

        Self {
            kind: "HystrixCommand",
            name: envelope.name.clone(),
            group: envelope.group.clone(),
            current_time: envelope.time,
            is_circuit_breaker_open: envelope.open,
            error_percentage,
            error_count: stats.failed + stats.timed_out,
            request_count: stats.total,
            rolling_count_success: stats.successful,
            rolling_count_failure: stats.failed,
            rolling_count_timeout: stats.timed_out,
            rolling_count_short_circuited: stats.short_circuited,
            latency_execute_mean: stats.latency_mean,
            latency_execute: latency.clone(),
            latency_total_mean: stats.latency_mean,
            latency_total: latency,
            request_volume_threshold: envelope.wait_threshold,
            error_threshold_percentage: (envelope.threshold * 100.0).round() as u64,
            sleep_window_ms: envelope.circuit_duration,
            reporting_hosts: 1,
        }
    }

    /// Render as one server-sent event: `data: <json>\n\n`.
    pub fn sse_frame(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

/// Translate a fractional percentile key into its dashboard label
/// (`"0.25"` → `"25"`, `"0.995"` → `"99.5"`). Unparseable keys pass
/// through untouched.
fn percentile_label(key: &str) -> String {
    key.parse::<f64>()
        .map(|p| format!("{}", p * 100.0))
        .unwrap_or_else(|_| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::TotalStats;
    use std::time::Duration;

    fn unregistered_breaker(name: &str) -> Breaker {
        Breaker::builder()
            .name(name)
            .stat_interval(Duration::from_millis(30))
            .register_global(false)
            .build()
    }

    fn sample_envelope() -> SnapshotEnvelope {
        let mut percentiles = BTreeMap::new();
        percentiles.insert("0".to_string(), 10);
        percentiles.insert("0.5".to_string(), 30);
        percentiles.insert("0.995".to_string(), 45);
        percentiles.insert("1".to_string(), 50);

        SnapshotEnvelope {
            name: "api".to_string(),
            group: "edge".to_string(),
            time: 1234,
            open: false,
            circuit_duration: 30_000,
            threshold: 0.5,
            wait_threshold: 100,
            stats: TotalStats {
                total: 10,
                successful: 8,
                failed: 1,
                timed_out: 1,
                short_circuited: 3,
                latency_mean: 30,
                percentiles,
                ..TotalStats::default()
            },
        }
    }

    #[tokio::test]
    async fn test_register_and_deregister() {
        let registry = GlobalRegistry::new();
        let breaker = unregistered_breaker("a");

        assert_eq!(registry.instance_count(), 0);
        registry.register(&breaker);
        assert_eq!(registry.instance_count(), 1);
        assert!(registry.contains(&breaker));

        // Double registration is a no-op
        registry.register(&breaker);
        assert_eq!(registry.instance_count(), 1);

        registry.deregister(&breaker);
        assert_eq!(registry.instance_count(), 0);
        assert!(!registry.contains(&breaker));

        // Deregistering again is harmless
        registry.deregister(&breaker);
        assert_eq!(registry.instance_count(), 0);
    }

    #[tokio::test]
    async fn test_snapshots_are_forwarded_to_raw_feed() {
        let registry = GlobalRegistry::new();
        let breaker = unregistered_breaker("forwarded");
        registry.register(&breaker);

        let mut rx = registry.subscribe_raw();
        breaker.stats().success(25);

        let envelope = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("raw envelope within 500ms")
            .expect("feed open");
        assert_eq!(envelope.name, "forwarded");
        assert_eq!(envelope.stats.lifetime.count_success, 1);
    }

    #[tokio::test]
    async fn test_deregistered_breaker_stops_feeding() {
        let registry = GlobalRegistry::new();
        let breaker = unregistered_breaker("silenced");
        registry.register(&breaker);
        registry.deregister(&breaker);

        let mut rx = registry.subscribe_raw();
        breaker.snapshot_now();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err(), "no envelopes after deregistration");
    }

    #[tokio::test]
    async fn test_dashboard_feed_emits_sse_frames() {
        let registry = GlobalRegistry::new();
        let breaker = unregistered_breaker("framed");
        registry.register(&breaker);

        let mut rx = registry.subscribe_dashboard();
        breaker.stats().success(25);

        let frame = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("sse frame within 500ms")
            .expect("feed open");
        assert!(frame.starts_with("data: {"), "got: {}", frame);
        assert!(frame.ends_with("\n\n"));
        assert!(frame.contains("\"HystrixCommand\""));
        assert!(frame.contains("\"framed\""));
    }

    #[test]
    fn test_dashboard_mapping_fields() {
        let metrics = DashboardMetrics::from_envelope(&sample_envelope());

        assert_eq!(metrics.kind, "HystrixCommand");
        assert_eq!(metrics.error_percentage, 20);
        assert_eq!(metrics.error_count, 2);
        assert_eq!(metrics.request_count, 10);
        assert_eq!(metrics.rolling_count_success, 8);
        assert_eq!(metrics.rolling_count_failure, 1);
        assert_eq!(metrics.rolling_count_timeout, 1);
        assert_eq!(metrics.rolling_count_short_circuited, 3);
        assert_eq!(metrics.latency_execute_mean, 30);
        assert_eq!(metrics.request_volume_threshold, 100);
        assert_eq!(metrics.error_threshold_percentage, 50);
        assert_eq!(metrics.sleep_window_ms, 30_000);
        assert_eq!(metrics.reporting_hosts, 1);
    }

    #[test]
    fn test_percentile_labels_translate_fractional_keys() {
        let metrics = DashboardMetrics::from_envelope(&sample_envelope());

        assert_eq!(metrics.latency_execute["0"], 10);
        assert_eq!(metrics.latency_execute["50"], 30);
        assert_eq!(metrics.latency_execute["99.5"], 45);
        assert_eq!(metrics.latency_execute["100"], 50);
        assert_eq!(metrics.latency_total, metrics.latency_execute);
    }

    #[test]
    fn test_unconfigured_percentiles_leave_holes() {
        let mut envelope = sample_envelope();
        envelope.stats.percentiles.clear();
        envelope
            .stats
            .percentiles
            .insert("0.5".to_string(), 30);

        let metrics = DashboardMetrics::from_envelope(&envelope);
        assert_eq!(metrics.latency_execute.len(), 1);
        assert_eq!(metrics.latency_execute["50"], 30);
        assert!(!metrics.latency_execute.contains_key("99.5"));
    }

    #[test]
    fn test_error_percentage_zero_on_empty_window() {
        let mut envelope = sample_envelope();
        envelope.stats = TotalStats::default();

        let metrics = DashboardMetrics::from_envelope(&envelope);
        assert_eq!(metrics.error_percentage, 0);
    }

    #[test]
    fn test_sse_frame_shape_and_wire_names() {
        let metrics = DashboardMetrics::from_envelope(&sample_envelope());
        let frame = metrics.sse_frame().unwrap();

        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));

        let json: serde_json::Value =
            serde_json::from_str(frame.trim_start_matches("data: ").trim_end()).unwrap();
        assert_eq!(json["type"], "HystrixCommand");
        assert_eq!(json["errorPercentage"], 20);
        assert_eq!(json["latencyExecute_mean"], 30);
        assert_eq!(json["latencyExecute"]["99.5"], 45);
        assert_eq!(
            json["propertyValue_circuitBreakerSleepWindowInMilliseconds"],
            30_000
        );
    }
}

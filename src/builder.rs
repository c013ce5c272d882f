//! Builder API for breaker configuration
//!
//! Every recognised option with its default:
//!
//! | option | default |
//! |---|---|
//! | `name` | `"defaultBrake"` |
//! | `group` | `"defaultBrakeGroup"` |
//! | `bucket_span` | 1000 ms |
//! | `bucket_num` | 60 |
//! | `stat_interval` | 1200 ms |
//! | `percentiles` | `[0, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 0.995, 1]` |
//! | `circuit_duration` | 30 000 ms |
//! | `wait_threshold` | 100 |
//! | `threshold` | 0.5 |
//! | `timeout` | 15 000 ms |
//! | `health_check` | none |
//! | `health_check_interval` | 5000 ms |
//! | `register_global` | true |
//! | `modify_error` | true |

use crate::breaker::{Breaker, BreakerConfig, BoxError, HealthCheckFn};
use crate::circuit::OpFuture;
use crate::events::Callbacks;
use crate::stats::StatsConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`Breaker`]s with a fluent API
pub struct BreakerBuilder {
    cfg: BreakerConfig,
    stats: StatsConfig,
    health_check: Option<HealthCheckFn>,
    callbacks: Callbacks,
}

impl BreakerBuilder {
    pub fn new() -> Self {
        Self {
            cfg: BreakerConfig::default(),
            stats: StatsConfig::default(),
            health_check: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Identifier used in errors and snapshots.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.cfg.name = name.into();
        self
    }

    /// Dashboard grouping key.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.cfg.group = group.into();
        self
    }

    /// Rotation period of the statistics ring.
    pub fn bucket_span(mut self, span: Duration) -> Self {
        self.stats.bucket_span = span;
        self
    }

    /// Number of buckets in the statistics ring.
    pub fn bucket_num(mut self, num: usize) -> Self {
        self.stats.bucket_num = num;
        self
    }

    /// Snapshot publication period.
    pub fn stat_interval(mut self, interval: Duration) -> Self {
        self.stats.stat_interval = interval;
        self
    }

    /// Percentiles computed per snapshot. Values are clamped to `[0, 1]`,
    /// sorted, and deduplicated.
    pub fn percentiles(mut self, percentiles: Vec<f64>) -> Self {
        self.stats.percentiles = percentiles;
        self
    }

    /// Cooldown before closing again when no health check is configured.
    pub fn circuit_duration(mut self, duration: Duration) -> Self {
        self.cfg.circuit_duration = duration;
        self
    }

    /// Window total that must be exceeded (strictly) before the success
    /// ratio is consulted.
    pub fn wait_threshold(mut self, total: u64) -> Self {
        self.cfg.wait_threshold = total;
        self
    }

    /// Minimum success ratio (0.0–1.0); below it the breaker opens.
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.cfg.threshold = threshold.clamp(0.0, 1.0);
        self
    }

    /// Default per-exec deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.cfg.timeout = timeout;
        self
    }

    /// Out-of-band probe whose success heals an open breaker without
    /// waiting out the cooldown. Probe failures are observational only.
    pub fn health_check<F, Fut>(mut self, check: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.health_check = Some(Arc::new(move || {
            let fut: OpFuture<(), BoxError> = Box::pin(check());
            fut
        }));
        self
    }

    /// Health probe period.
    pub fn health_check_interval(mut self, interval: Duration) -> Self {
        self.cfg.health_check_interval = interval;
        self
    }

    /// Register with the process-wide registry on construction.
    pub fn register_global(mut self, register: bool) -> Self {
        self.cfg.register_global = register;
        self
    }

    /// Prefix surfaced errors with `[Breaker: <name>] `.
    pub fn modify_error(mut self, modify: bool) -> Self {
        self.cfg.modify_error = modify;
        self
    }

    /// Hook invoked (panic-isolated) when the breaker opens.
    pub fn on_open<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(hook));
        self
    }

    /// Hook invoked (panic-isolated) when the breaker closes.
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(hook));
        self
    }

    /// Build the breaker and start its statistics timers.
    pub fn build(self) -> Breaker {
        Breaker::assemble(self.cfg, self.stats, self.health_check, self.callbacks)
    }
}

impl Default for BreakerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! Fusebox - circuit breaker runtime with rolling statistics
//!
//! This crate wraps fallible, latency-bounded operations with:
//! - Failure isolation: once an operation fails often enough the breaker
//!   opens and further calls short-circuit to a fast error or a fallback
//! - Timeout enforcement: every invocation runs under a wall-clock budget;
//!   late results are discarded, never awaited by the caller
//! - Statistical observability: a rolling window of per-outcome buckets
//!   publishes latency percentiles and lifetime counters on broadcast
//!   feeds, with a process-wide registry multiplexing every breaker into
//!   one dashboard stream
//!
//! Healing is probe-driven when a health check is configured, otherwise a
//! fixed cooldown closes the breaker again. Generation tags guarantee that
//! results still in flight from before the breaker opened cannot bias the
//! fresh statistics window.
//!
//! All four timers (bucket rotation, snapshots, health probes, cooldown)
//! run as detached tasks on the ambient tokio runtime. They never keep the
//! host process alive: the breaker is a library, not a daemon, and its
//! timers die with the runtime.
//!
//! # Example
//!
//! ```no_run
//! use fusebox::Breaker;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let breaker = Breaker::builder()
//!         .name("catalog")
//!         .wait_threshold(20)
//!         .threshold(0.5)
//!         .timeout(Duration::from_millis(500))
//!         .build();
//!
//!     let circuit = breaker.circuit(|sku: u64| async move {
//!         if sku == 0 {
//!             Err("unknown sku".to_string())
//!         } else {
//!             Ok(sku * 2)
//!         }
//!     });
//!
//!     match circuit.exec(21).await {
//!         Ok(value) => println!("fetched {value}"),
//!         Err(err) => eprintln!("lookup failed: {err}"),
//!     }
//!
//!     // Every registered breaker feeds the dashboard stream
//!     let mut feed = fusebox::GlobalRegistry::global().subscribe_dashboard();
//!     if let Ok(frame) = feed.recv().await {
//!         print!("{frame}");
//!     }
//! }
//! ```

pub mod breaker;
pub mod bucket;
pub mod builder;
pub mod circuit;
pub mod classifier;
pub mod errors;
pub mod events;
pub mod registry;
pub mod stats;

pub use breaker::{BoxError, Breaker, BreakerConfig, HealthCheckFn, SnapshotEnvelope};
pub use bucket::{Bucket, CumulativeStats};
pub use builder::BreakerBuilder;
pub use circuit::{Circuit, FallbackFn, OpFuture, PrimaryFn};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use errors::{BreakerError, InvalidBucketField};
pub use events::{BreakerEvent, Callbacks};
pub use registry::{DashboardMetrics, GlobalRegistry};
pub use stats::{Stats, StatsConfig, TotalStats};

/// Spawn a detached task when a tokio runtime is available.
///
/// Timer and feed tasks degrade gracefully outside a runtime: recording
/// and aggregation still work, only the periodic machinery is absent.
pub(crate) fn try_spawn<F>(future: F) -> Option<tokio::task::JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::runtime::Handle::try_current()
        .ok()
        .map(|handle| handle.spawn(future))
}

//! Breaker event taxonomy and transition hooks
//!
//! Observers have two surfaces: a typed broadcast feed carrying every
//! [`BreakerEvent`], and plain callback slots for the open/close
//! transitions. Callbacks run through `catch_unwind` so a panicking hook
//! cannot poison the breaker's timer tasks.

use crate::breaker::SnapshotEnvelope;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// One observable breaker event
///
/// `Failure` and `Timeout` carry the generation captured when the
/// originating `exec` started. A stale generation is dropped before the
/// statistics are touched; the event itself remains observable.
#[derive(Debug, Clone)]
pub enum BreakerEvent {
    /// An `exec` call arrived
    Exec,
    /// The primary resolved within its deadline
    Success { elapsed_ms: u64 },
    /// The primary failed and the classifier counted it
    Failure { elapsed_ms: u64, generation: u64 },
    /// The deadline fired before the primary resolved
    Timeout { elapsed_ms: u64, generation: u64 },
    /// An `exec` call was rejected because the breaker was open
    ShortCircuit,
    /// The breaker transitioned closed → open
    CircuitOpen,
    /// The breaker transitioned open → closed
    CircuitClosed,
    /// A health probe rejected; the breaker stays open and keeps probing
    HealthCheckFailed { message: String },
    /// A periodic statistics snapshot, wrapped with breaker metadata
    Snapshot(SnapshotEnvelope),
}

/// Type alias for transition hook functions
pub type CallbackFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Hooks for breaker state transitions
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<CallbackFn>,
    pub on_close: Option<CallbackFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trigger the on_open hook, swallowing any panic it raises.
    pub fn trigger_open(&self, breaker: &str) {
        if let Some(ref callback) = self.on_open {
            let cb = AssertUnwindSafe(callback);
            let _ = catch_unwind(|| cb(breaker));
        }
    }

    /// Trigger the on_close hook, swallowing any panic it raises.
    pub fn trigger_close(&self, breaker: &str) {
        if let Some(ref callback) = self.on_close {
            let cb = AssertUnwindSafe(callback);
            let _ = catch_unwind(|| cb(breaker));
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

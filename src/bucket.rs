//! Per-slice outcome tallies for the rolling window
//!
//! A [`Bucket`] covers one time slice. Every recorded outcome writes two
//! places in lockstep: the bucket's own counters and the breaker-lifetime
//! [`CumulativeStats`], which lives under the same lock as the window.

use crate::errors::InvalidBucketField;
use serde::Serialize;

/// Lifetime counters with per-interval derivatives
///
/// The plain counters only ever grow. Each `…_deriv` sibling accumulates
/// the same events but is zeroed at every snapshot boundary, so it reads as
/// the delta since the previous snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CumulativeStats {
    pub count_total: u64,
    pub count_success: u64,
    pub count_failure: u64,
    pub count_timeout: u64,
    pub count_short_circuited: u64,
    pub count_total_deriv: u64,
    pub count_success_deriv: u64,
    pub count_failure_deriv: u64,
    pub count_timeout_deriv: u64,
    pub count_short_circuited_deriv: u64,
}

impl CumulativeStats {
    fn success(&mut self) {
        self.count_total += 1;
        self.count_total_deriv += 1;
        self.count_success += 1;
        self.count_success_deriv += 1;
    }

    fn failure(&mut self) {
        self.count_total += 1;
        self.count_total_deriv += 1;
        self.count_failure += 1;
        self.count_failure_deriv += 1;
    }

    fn timeout(&mut self) {
        self.count_total += 1;
        self.count_total_deriv += 1;
        self.count_timeout += 1;
        self.count_timeout_deriv += 1;
    }

    fn short_circuit(&mut self) {
        self.count_short_circuited += 1;
        self.count_short_circuited_deriv += 1;
    }

    /// Zero every `…_deriv` field. Called after each snapshot is published.
    pub fn reset_derivs(&mut self) {
        self.count_total_deriv = 0;
        self.count_success_deriv = 0;
        self.count_failure_deriv = 0;
        self.count_timeout_deriv = 0;
        self.count_short_circuited_deriv = 0;
    }
}

/// Outcome counts and latency samples for one time slice
///
/// Invariants: `total == successful + failed + timed_out`, and
/// `request_times.len() == total`. Short circuits are tracked separately
/// and contribute to neither.
#[derive(Debug, Default)]
pub struct Bucket {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub short_circuited: u64,
    /// Latency samples in ms. Insertion order is irrelevant; aggregation
    /// sorts before computing percentiles.
    pub request_times: Vec<u64>,
}

impl Bucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful call that took `run_time` ms.
    pub fn success(&mut self, run_time: u64, lifetime: &mut CumulativeStats) {
        self.total += 1;
        self.successful += 1;
        self.request_times.push(run_time);
        lifetime.success();
    }

    /// Record a failed call that took `run_time` ms.
    pub fn failure(&mut self, run_time: u64, lifetime: &mut CumulativeStats) {
        self.total += 1;
        self.failed += 1;
        self.request_times.push(run_time);
        lifetime.failure();
    }

    /// Record a call that hit its deadline after `run_time` ms.
    pub fn timeout(&mut self, run_time: u64, lifetime: &mut CumulativeStats) {
        self.total += 1;
        self.timed_out += 1;
        self.request_times.push(run_time);
        lifetime.timeout();
    }

    /// Record a call rejected because the breaker was open.
    ///
    /// Does not touch `total` or the latency samples, so an open breaker
    /// cannot feed its own threshold check.
    pub fn short_circuit(&mut self, lifetime: &mut CumulativeStats) {
        self.short_circuited += 1;
        lifetime.short_circuit();
    }

    /// Ratio of one counter to `total` (0 when the bucket is empty).
    ///
    /// Recognised fields are the counter names: `"total"`, `"successful"`,
    /// `"failed"`, `"timed_out"`, `"short_circuited"`.
    pub fn percent(&self, field: &str) -> Result<f64, InvalidBucketField> {
        let value = match field {
            "total" => self.total,
            "successful" => self.successful,
            "failed" => self.failed,
            "timed_out" => self.timed_out,
            "short_circuited" => self.short_circuited,
            _ => {
                return Err(InvalidBucketField {
                    field: field.to_string(),
                })
            }
        };
        if self.total == 0 {
            return Ok(0.0);
        }
        Ok(value as f64 / self.total as f64)
    }
}

//! Error types for breaker operations

use crate::stats::TotalStats;
use std::error::Error;
use std::fmt;

/// Errors surfaced by [`Circuit::exec`](crate::Circuit::exec)
///
/// `E` is the error type of the wrapped operation. When the parent breaker
/// is configured with `modify_error` (the default), surfaced errors render
/// with a `[Breaker: <name>] ` prefix.
#[derive(Debug)]
pub enum BreakerError<E = Box<dyn Error + Send + Sync>> {
    /// The breaker is open and no fallback was available
    Open {
        circuit: String,
        stats: TotalStats,
        threshold: f64,
    },
    /// The operation outlived its wall-clock deadline
    Timeout { circuit: Option<String> },
    /// The wrapped operation (or its fallback) failed
    Execution { circuit: Option<String>, source: E },
}

impl<E> BreakerError<E> {
    /// True when the call was rejected without running the operation
    pub fn is_open_rejection(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// True when the deadline fired before the operation resolved
    pub fn is_timeout(&self) -> bool {
        matches!(self, BreakerError::Timeout { .. })
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open {
                circuit,
                stats,
                threshold,
            } => {
                let fail_pct = if stats.total == 0 {
                    0.0
                } else {
                    (1.0 - stats.successful as f64 / stats.total as f64) * 100.0
                };
                write!(
                    f,
                    "[Breaker: {}] circuit open: {:.1}% of requests failing (threshold {})",
                    circuit, fail_pct, threshold
                )
            }
            BreakerError::Timeout { circuit } => match circuit {
                Some(name) => write!(f, "[Breaker: {}] Request Timed out", name),
                None => write!(f, "Request Timed out"),
            },
            BreakerError::Execution { circuit, source } => match circuit {
                Some(name) => write!(f, "[Breaker: {}] {}", name, source),
                None => write!(f, "{}", source),
            },
        }
    }
}

impl<E: Error + 'static> Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BreakerError::Execution { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// [`Bucket::percent`](crate::Bucket::percent) was asked about a counter
/// that does not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidBucketField {
    pub field: String,
}

impl fmt::Display for InvalidBucketField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown bucket field: {}", self.field)
    }
}

impl Error for InvalidBucketField {}

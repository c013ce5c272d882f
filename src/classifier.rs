//! Failure classification for error filtering
//!
//! Decides which operation errors count toward opening the breaker.
//! Unclassified errors are still surfaced to the caller, but leave no
//! trace in the rolling statistics.

use std::fmt;
use std::time::Duration;

/// Context handed to classifiers when an operation fails
#[derive(Debug)]
pub struct FailureContext<'a, E> {
    /// Name of the breaker the circuit belongs to
    pub circuit: &'a str,
    /// The error produced by the operation
    pub error: &'a E,
    /// How long the failed call ran before erroring
    pub elapsed: Duration,
}

/// Decides whether an error is a breaker-relevant failure
///
/// Returning `false` means the error is surfaced to the caller without
/// being recorded — the operation failed, but the breaker treats it as a
/// non-signal (a validation error, say, rather than a sick dependency).
pub trait FailureClassifier<E>: Send + Sync {
    fn is_failure(&self, ctx: &FailureContext<'_, E>) -> bool;
}

/// Default classifier: every error counts
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl<E> FailureClassifier<E> for DefaultClassifier {
    fn is_failure(&self, _ctx: &FailureContext<'_, E>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
///
/// # Examples
///
/// ```rust
/// use fusebox::{FailureClassifier, FailureContext, PredicateClassifier};
/// use std::time::Duration;
///
/// // Only slow errors indicate a sick dependency
/// let classifier = PredicateClassifier::new(|ctx: &FailureContext<'_, String>| {
///     ctx.elapsed > Duration::from_millis(500)
/// });
/// ```
pub struct PredicateClassifier<F> {
    predicate: F,
}

impl<F> PredicateClassifier<F> {
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<E, F> FailureClassifier<E> for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_, E>) -> bool + Send + Sync,
{
    fn is_failure(&self, ctx: &FailureContext<'_, E>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> fmt::Debug for PredicateClassifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<E>(error: &E, elapsed_ms: u64) -> FailureContext<'_, E> {
        FailureContext {
            circuit: "test",
            error,
            elapsed: Duration::from_millis(elapsed_ms),
        }
    }

    #[test]
    fn test_default_classifier_trips_on_everything() {
        let classifier = DefaultClassifier;
        let err = "any error".to_string();
        assert!(classifier.is_failure(&ctx(&err, 1)));
    }

    #[test]
    fn test_predicate_classifier_on_elapsed_time() {
        // Only trip on errors that took longer than a second
        let classifier = PredicateClassifier::new(|ctx: &FailureContext<'_, String>| {
            ctx.elapsed > Duration::from_secs(1)
        });

        let err = "slow".to_string();
        assert!(!classifier.is_failure(&ctx(&err, 500)));
        assert!(classifier.is_failure(&ctx(&err, 2000)));
    }

    #[test]
    fn test_predicate_classifier_on_typed_error() {
        #[derive(Debug)]
        enum ApiError {
            Client(u16),
            Server(u16),
        }

        // Server errors (5xx) trip the breaker, client errors (4xx) do not
        let classifier = PredicateClassifier::new(|ctx: &FailureContext<'_, ApiError>| {
            matches!(ctx.error, ApiError::Server(code) if *code >= 500)
        });

        assert!(!classifier.is_failure(&ctx(&ApiError::Client(404), 1)));
        assert!(classifier.is_failure(&ctx(&ApiError::Server(503), 1)));
    }

    #[test]
    fn test_context_carries_circuit_name() {
        let classifier = PredicateClassifier::new(|ctx: &FailureContext<'_, String>| {
            ctx.circuit == "payments"
        });

        let err = "boom".to_string();
        let context = FailureContext {
            circuit: "payments",
            error: &err,
            elapsed: Duration::ZERO,
        };
        assert!(classifier.is_failure(&context));
    }
}

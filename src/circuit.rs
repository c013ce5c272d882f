//! Invocation pipeline: timeout-bounded execution and fallback dispatch
//!
//! A [`Circuit`] binds one primary operation (and optionally a fallback)
//! to a parent [`Breaker`]. `exec` short-circuits while the breaker is
//! open, otherwise runs the primary under a wall-clock deadline and
//! reports the classified outcome back to the breaker.

use crate::breaker::Breaker;
use crate::classifier::{DefaultClassifier, FailureClassifier, FailureContext};
use crate::errors::BreakerError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Boxed future returned by wrapped operations
pub type OpFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

/// Type alias for the primary operation
pub type PrimaryFn<Req, T, E> = Arc<dyn Fn(Req) -> OpFuture<T, E> + Send + Sync>;

/// Type alias for fallback operations
pub type FallbackFn<Req, T, E> = Arc<dyn Fn(Req) -> OpFuture<T, E> + Send + Sync>;

/// One `(primary, fallback?)` pair bound to a parent breaker
///
/// Construct with [`Breaker::circuit`] or [`Breaker::circuit_with_fallback`]
/// and refine with the chainable `with_*` methods. Clones share the same
/// operations and breaker.
pub struct Circuit<Req, T, E> {
    breaker: Breaker,
    primary: PrimaryFn<Req, T, E>,
    fallback: Option<FallbackFn<Req, T, E>>,
    timeout: Option<Duration>,
    classifier: Arc<dyn FailureClassifier<E>>,
    modify_error: bool,
}

impl Breaker {
    /// Bind an operation to this breaker.
    pub fn circuit<Req, T, E, F, Fut>(&self, primary: F) -> Circuit<Req, T, E>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Circuit {
            breaker: self.clone(),
            primary: Arc::new(move |req| {
                let fut: OpFuture<T, E> = Box::pin(primary(req));
                fut
            }),
            fallback: None,
            timeout: None,
            classifier: Arc::new(DefaultClassifier),
            modify_error: self.config().modify_error,
        }
    }

    /// Bind an operation plus a fallback to this breaker.
    pub fn circuit_with_fallback<Req, T, E, F, FFut, G, GFut>(
        &self,
        primary: F,
        fallback: G,
    ) -> Circuit<Req, T, E>
    where
        F: Fn(Req) -> FFut + Send + Sync + 'static,
        FFut: Future<Output = Result<T, E>> + Send + 'static,
        G: Fn(Req) -> GFut + Send + Sync + 'static,
        GFut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.circuit(primary).with_fallback(fallback)
    }
}

impl<Req, T, E> Circuit<Req, T, E> {
    /// Dispatched when the primary fails, times out, or is short-circuited.
    /// The fallback's own outcome is never recorded in the statistics.
    pub fn with_fallback<G, Fut>(mut self, fallback: G) -> Self
    where
        G: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(move |req| {
            let fut: OpFuture<T, E> = Box::pin(fallback(req));
            fut
        }));
        self
    }

    /// Override the breaker's default per-exec deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Decide which errors count toward opening the breaker.
    pub fn with_classifier(mut self, classifier: Arc<dyn FailureClassifier<E>>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Surface errors verbatim, without the `[Breaker: <name>] ` prefix.
    pub fn without_error_prefix(mut self) -> Self {
        self.modify_error = false;
        self
    }

    /// The parent breaker.
    pub fn breaker(&self) -> &Breaker {
        &self.breaker
    }

    fn error_name(&self) -> Option<String> {
        if self.modify_error {
            Some(self.breaker.name().to_string())
        } else {
            None
        }
    }

    fn execution_error(&self, source: E) -> BreakerError<E> {
        BreakerError::Execution {
            circuit: self.error_name(),
            source,
        }
    }
}

impl<Req, T, E> Circuit<Req, T, E>
where
    Req: Clone + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    /// Execute the primary under breaker protection.
    ///
    /// The deadline is enforced unilaterally: when it fires the caller gets
    /// the timeout error immediately, while the operation itself keeps
    /// running detached and its eventual result is discarded.
    pub async fn exec(&self, req: Req) -> Result<T, BreakerError<E>> {
        self.breaker.emit_exec();
        let generation = self.breaker.generation();

        if self.breaker.is_open() {
            let totals = self.breaker.record_short_circuit();
            if let Some(fallback) = &self.fallback {
                return self.run_fallback(fallback.clone(), req).await;
            }
            return Err(BreakerError::Open {
                circuit: self.breaker.name().to_string(),
                stats: totals,
                threshold: self.breaker.config().threshold,
            });
        }

        let deadline = self.timeout.unwrap_or(self.breaker.config().timeout);
        let start = Instant::now();
        let mut task = tokio::spawn((self.primary)(req.clone()));

        match tokio::time::timeout(deadline, &mut task).await {
            Ok(Ok(Ok(value))) => {
                self.breaker.on_success(elapsed_ms(start), generation);
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                let elapsed = start.elapsed();
                let context = FailureContext {
                    circuit: self.breaker.name(),
                    error: &err,
                    elapsed,
                };
                if self.classifier.is_failure(&context) {
                    self.breaker
                        .on_failure(elapsed.as_millis() as u64, generation);
                }
                if let Some(fallback) = &self.fallback {
                    return self.run_fallback(fallback.clone(), req).await;
                }
                Err(self.execution_error(err))
            }
            Ok(Err(join_err)) => {
                if join_err.is_panic() {
                    std::panic::resume_unwind(join_err.into_panic());
                }
                // Only reachable while the runtime is shutting down
                Err(BreakerError::Timeout {
                    circuit: self.error_name(),
                })
            }
            Err(_deadline) => {
                // `task` is dropped, not aborted: the operation runs to
                // completion detached and its result is discarded.
                self.breaker.on_timeout(elapsed_ms(start), generation);
                if let Some(fallback) = &self.fallback {
                    return self.run_fallback(fallback.clone(), req).await;
                }
                Err(BreakerError::Timeout {
                    circuit: self.error_name(),
                })
            }
        }
    }

    async fn run_fallback(
        &self,
        fallback: FallbackFn<Req, T, E>,
        req: Req,
    ) -> Result<T, BreakerError<E>> {
        fallback(req).await.map_err(|err| self.execution_error(err))
    }
}

impl<Req, T, E> Clone for Circuit<Req, T, E> {
    fn clone(&self) -> Self {
        Self {
            breaker: self.breaker.clone(),
            primary: self.primary.clone(),
            fallback: self.fallback.clone(),
            timeout: self.timeout,
            classifier: self.classifier.clone(),
            modify_error: self.modify_error,
        }
    }
}

impl<Req, T, E> std::fmt::Debug for Circuit<Req, T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("breaker", &self.breaker.name())
            .field("fallback", &self.fallback.is_some())
            .field("timeout", &self.timeout)
            .field("classifier", &"<dyn FailureClassifier>")
            .finish()
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

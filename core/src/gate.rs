//! Call gate: the resilience pipeline around one dependency
//!
//! A call passes the bulkhead, then loops over attempts. Each attempt asks the
//! breaker for a permit, runs the body under the attempt timeout, records the
//! outcome and lets the retry policy decide whether to sleep and go again.
//! The bulkhead permit is held for the whole loop, retries included.
//!
//! Terminal rejections (bulkhead full, breaker open, retries exhausted) are
//! handed to the registered fallback, if any. Domain errors the retry
//! classifier refuses are returned unchanged.

use crate::builder::CircuitBuilder;
use crate::bulkhead::{Bulkhead, BulkheadMetrics, QueueError};
use crate::circuit::{Admission, BreakerConfig, BreakerMetrics, CircuitBreaker, FallbackContext};
use crate::classifier::{FailureContext, RetryClassifier};
use crate::clock::{self, Clock, MonotonicClock};
use crate::errors::{ConfigError, ExhaustedReason, GateError};
use crate::retry::{RetryConfig, RetryDecision, RetryPolicy, StopReason};
use parking_lot::RwLock;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Fallback invoked on terminal rejection
pub type Fallback<T, E> =
    Arc<dyn Fn(&FallbackContext, GateError<E>) -> Result<T, GateError<E>> + Send + Sync>;

type RetryHook = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

/// Per-call deadline and cancellation
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub deadline: Option<Instant>,
    pub cancel: CancellationToken,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }
}

/// Emitted before every retry sleep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    pub gate: String,
    /// The attempt that just failed
    pub attempt: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct GateMetrics {
    pub name: String,
    pub breaker: BreakerMetrics,
    pub bulkhead: Option<BulkheadMetrics>,
}

/// Resilience pipeline shared by every caller of one dependency
pub struct CallGate {
    name: String,
    breaker: CircuitBreaker,
    bulkhead: Option<Bulkhead>,
    retry: RetryPolicy,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
    attempt_timeout: Option<Duration>,
    clock: Arc<dyn Clock>,
    fallback: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
    on_retry: Option<RetryHook>,
}

impl CallGate {
    pub fn builder(name: impl Into<String>) -> GateBuilder {
        GateBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn metrics(&self) -> GateMetrics {
        GateMetrics {
            name: self.name.clone(),
            breaker: self.breaker.metrics(),
            bulkhead: self.bulkhead.as_ref().map(Bulkhead::metrics),
        }
    }

    /// Register the fallback for calls returning `Result<T, GateError<E>>`
    ///
    /// Replaces any previous fallback. Calls with other `T`/`E` types skip it.
    pub fn set_fallback<T, E, F>(&self, fallback: F)
    where
        F: Fn(&FallbackContext, GateError<E>) -> Result<T, GateError<E>> + Send + Sync + 'static,
        T: 'static,
        E: 'static,
    {
        let fallback: Fallback<T, E> = Arc::new(fallback);
        *self.fallback.write() = Some(Arc::new(fallback));
    }

    pub fn clear_fallback(&self) {
        *self.fallback.write() = None;
    }

    /// Run `body` through the pipeline
    ///
    /// `body` is called once per attempt. A timed-out or cancelled attempt
    /// drops the future it returned.
    pub async fn execute<T, E, F, Fut>(
        self: &Arc<Self>,
        ctx: &CallContext,
        body: F,
    ) -> Result<T, GateError<E>>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let result = match &self.bulkhead {
            None => self.run(ctx, body).await,
            Some(Bulkhead::Semaphore { permits, max_wait }) => {
                let wait = clock::remaining(&*self.clock, ctx.deadline)
                    .map_or(*max_wait, |left| left.min(*max_wait));
                let permit = tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(self.cancelled()),
                    permit = permits.acquire(wait) => permit,
                };

                match permit {
                    Some(_permit) => self.run(ctx, body).await,
                    None => {
                        debug!(gate = %self.name, "bulkhead full");
                        Err(GateError::BulkheadFull {
                            gate: self.name.clone(),
                            limit: permits.limit(),
                        })
                    }
                }
            }
            Some(Bulkhead::Queue(queue)) => {
                let gate = Arc::clone(self);
                let job_ctx = ctx.clone();
                match queue.submit(move || async move { gate.run(&job_ctx, body).await }) {
                    Ok(handle) => tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => Err(self.cancelled()),
                        joined = handle.join() => joined.unwrap_or_else(|_| Err(self.cancelled())),
                    },
                    Err(QueueError::Full) => {
                        debug!(gate = %self.name, "bulkhead queue full");
                        Err(GateError::BulkheadFull {
                            gate: self.name.clone(),
                            limit: queue.max_workers(),
                        })
                    }
                    Err(QueueError::Closed) => Err(self.cancelled()),
                }
            }
        };

        match result {
            Err(err) if err.rejection_kind().is_some() => self.fall_back(err),
            other => other,
        }
    }

    /// Attempt loop, running under the bulkhead
    async fn run<T, E, F, Fut>(&self, ctx: &CallContext, mut body: F) -> Result<T, GateError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let mut state = self.retry.start(self.clock.now(), ctx.deadline);
        let mut last: Option<GateError<E>> = None;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            // A spent deadline is never charged to the breaker
            if clock::remaining(&*self.clock, state.deadline) == Some(Duration::ZERO) {
                return Err(match last.take() {
                    Some(error) => self.exhausted(state.attempt, ExhaustedReason::Deadline, error),
                    None => GateError::Timeout {
                        gate: self.name.clone(),
                        after: Duration::ZERO,
                    },
                });
            }

            let permit = match self.breaker.try_acquire() {
                Admission::Admitted(permit) => permit,
                Admission::Rejected(rejection) => {
                    return Err(match last.take() {
                        Some(error) => {
                            self.exhausted(state.attempt, ExhaustedReason::CircuitOpen, error)
                        }
                        None => GateError::CircuitOpen {
                            gate: self.name.clone(),
                            state: rejection.state,
                        },
                    });
                }
            };
            let attempt = state.begin_attempt();

            let left = clock::remaining(&*self.clock, state.deadline);
            let limit = match (self.attempt_timeout, left) {
                (Some(timeout), Some(left)) => Some(timeout.min(left)),
                (timeout, left) => timeout.or(left),
            };
            let call = async {
                match limit {
                    Some(limit) => tokio::time::timeout(limit, body()).await.map_err(|_| limit),
                    None => Ok(body().await),
                }
            };
            // Dropping the permit on cancellation hands back a probe slot
            let outcome = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(self.cancelled()),
                outcome = call => outcome,
            };

            let (error, retryable) = match outcome {
                Ok(Ok(value)) => {
                    permit.record_success();
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    let retryable = self.retry_classifier.as_ref().is_none_or(|classifier| {
                        classifier.is_retryable(&FailureContext {
                            circuit_name: &self.name,
                            error: &error as &dyn Any,
                            duration: permit.elapsed(),
                        })
                    });
                    permit.record_error(&error);
                    (GateError::Inner(error), retryable)
                }
                Err(after) => {
                    permit.record_timeout();
                    debug!(gate = %self.name, attempt, ?after, "attempt timed out");
                    (
                        GateError::Timeout {
                            gate: self.name.clone(),
                            after,
                        },
                        self.retry.config().retry_on_timeout,
                    )
                }
            };

            let reason = match self.retry.decide(&mut state, retryable, self.clock.now()) {
                RetryDecision::Retry(delay) => {
                    debug!(gate = %self.name, attempt, ?delay, "retrying");
                    if let Some(hook) = &self.on_retry {
                        hook(&RetryEvent {
                            gate: self.name.clone(),
                            attempt,
                            delay,
                        });
                    }
                    if clock::sleep_or_cancel(delay, &ctx.cancel).await.is_err() {
                        return Err(self.cancelled());
                    }
                    last = Some(error);
                    continue;
                }
                RetryDecision::Stop(StopReason::NonRetryable) => return Err(error),
                RetryDecision::Stop(StopReason::AttemptsExhausted) => ExhaustedReason::MaxAttempts,
                RetryDecision::Stop(StopReason::DeadlineExceeded) => ExhaustedReason::Deadline,
            };

            return Err(self.exhausted(attempt, reason, error));
        }
    }

    fn exhausted<E>(
        &self,
        attempts: u32,
        reason: ExhaustedReason,
        last: GateError<E>,
    ) -> GateError<E> {
        // Without a retry budget there is nothing to exhaust
        if self.retry.config().max_attempts == 1 {
            return last;
        }
        warn!(gate = %self.name, attempts, %reason, "giving up");
        GateError::RetriesExhausted {
            gate: self.name.clone(),
            attempts,
            reason,
            last: Box::new(last),
        }
    }

    fn fall_back<T: 'static, E: 'static>(&self, err: GateError<E>) -> Result<T, GateError<E>> {
        let Some(kind) = err.rejection_kind() else {
            return Err(err);
        };
        let Some(stored) = self.fallback.read().clone() else {
            return Err(err);
        };
        let Some(fallback) = stored.downcast_ref::<Fallback<T, E>>() else {
            warn!(gate = %self.name, "fallback registered for a different result type");
            return Err(err);
        };

        debug!(gate = %self.name, ?kind, "using fallback");
        let ctx = FallbackContext {
            circuit_name: self.name.clone(),
            kind,
            state: self.breaker.state(),
        };
        fallback(&ctx, err)
    }

    fn cancelled<E>(&self) -> GateError<E> {
        GateError::Cancelled {
            gate: self.name.clone(),
        }
    }
}

impl fmt::Debug for CallGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallGate")
            .field("name", &self.name)
            .field("breaker", &self.breaker)
            .field("bulkhead", &self.bulkhead)
            .field("retry", &self.retry)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("has_fallback", &self.fallback.read().is_some())
            .finish()
    }
}

enum BulkheadSpec {
    None,
    Semaphore { max_concurrent: usize, max_wait: Duration },
    Queue { max_workers: usize, capacity: usize },
}

/// Builder for [`CallGate`]
pub struct GateBuilder {
    name: String,
    breaker: CircuitBuilder,
    bulkhead: BulkheadSpec,
    retry: RetryConfig,
    retry_classifier: Option<Arc<dyn RetryClassifier>>,
    attempt_timeout: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
    on_retry: Option<RetryHook>,
}

impl GateBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBuilder::new(name.clone()),
            name,
            bulkhead: BulkheadSpec::None,
            retry: RetryConfig::default(),
            retry_classifier: None,
            attempt_timeout: None,
            clock: None,
            on_retry: None,
        }
    }

    pub fn breaker_config(mut self, config: BreakerConfig) -> Self {
        self.breaker = self.breaker.config(config);
        self
    }

    /// Customise the breaker (thresholds, classifier, callbacks)
    pub fn breaker<F>(mut self, configure: F) -> Self
    where
        F: FnOnce(CircuitBuilder) -> CircuitBuilder,
    {
        self.breaker = configure(self.breaker);
        self
    }

    /// Admit at most `max_concurrent` calls, waiting up to `max_wait` for a slot
    pub fn semaphore_bulkhead(mut self, max_concurrent: usize, max_wait: Duration) -> Self {
        self.bulkhead = BulkheadSpec::Semaphore {
            max_concurrent,
            max_wait,
        };
        self
    }

    /// Run calls on `max_workers` workers behind a queue of `capacity`
    ///
    /// `build()` must then be called inside a tokio runtime.
    pub fn queue_bulkhead(mut self, max_workers: usize, capacity: usize) -> Self {
        self.bulkhead = BulkheadSpec::Queue {
            max_workers,
            capacity,
        };
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn retry_classifier(mut self, classifier: Arc<dyn RetryClassifier>) -> Self {
        self.retry_classifier = Some(classifier);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Time source shared by the gate and its breaker
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(&RetryEvent) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Result<Arc<CallGate>, ConfigError> {
        if self.attempt_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::Zero("attempt_timeout"));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock));
        let breaker = self.breaker.clock(Arc::clone(&clock)).build()?;
        let retry = RetryPolicy::new(self.retry)?;
        let bulkhead = match self.bulkhead {
            BulkheadSpec::None => None,
            BulkheadSpec::Semaphore {
                max_concurrent,
                max_wait,
            } => Some(Bulkhead::semaphore(max_concurrent, max_wait)?),
            BulkheadSpec::Queue {
                max_workers,
                capacity,
            } => Some(Bulkhead::queue(max_workers, capacity)?),
        };

        Ok(Arc::new(CallGate {
            name: self.name,
            breaker,
            bulkhead,
            retry,
            retry_classifier: self.retry_classifier,
            attempt_timeout: self.attempt_timeout,
            clock,
            fallback: RwLock::new(None),
            on_retry: self.on_retry,
        }))
    }
}

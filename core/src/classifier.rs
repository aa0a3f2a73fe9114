//! Error classification
//!
//! Two questions are asked about every error a guarded body returns:
//! - does it count as a failure for the circuit breaker? (`FailureClassifier`)
//! - is it worth another attempt? (`RetryClassifier`)
//!
//! Both receive the error as `&dyn Any` so one classifier can serve gates with
//! unrelated error types.

use std::any::Any;
use std::time::Duration;

/// Context provided to classifiers for error evaluation
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Circuit or gate name
    pub circuit_name: &'a str,
    /// The error that occurred (can be downcast to specific types)
    pub error: &'a dyn Any,
    /// Duration of the failed call
    pub duration: Duration,
}

/// Decides whether an error should count toward opening the circuit
///
/// Errors that do not trip are recorded as successful calls: the dependency
/// answered, the caller just did not like the answer.
///
/// # Examples
///
/// ```rust
/// use resilience_machines::{FailureClassifier, FailureContext};
///
/// #[derive(Debug)]
/// struct ServerErrorClassifier;
///
/// impl FailureClassifier for ServerErrorClassifier {
///     fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
///         ctx.error
///             .downcast_ref::<u16>()
///             .map(|status| *status >= 500)
///             .unwrap_or(true)
///     }
/// }
/// ```
pub trait FailureClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` if the error should trip the circuit, `false` to ignore it.
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Decides whether a failed attempt may be retried
///
/// Terminal errors (validation failures, 4xx-style rejections) should return
/// `false`; transient ones (timeouts, resets, "overloaded") `true`.
pub trait RetryClassifier: Send + Sync + std::fmt::Debug {
    fn is_retryable(&self, ctx: &FailureContext<'_>) -> bool;
}

/// Default classifier: every error trips and every error is retryable
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClassifier;

impl FailureClassifier for DefaultClassifier {
    fn should_trip(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

impl RetryClassifier for DefaultClassifier {
    fn is_retryable(&self, _ctx: &FailureContext<'_>) -> bool {
        true
    }
}

/// Predicate-based classifier using a closure
///
/// Works as either a [`FailureClassifier`] or a [`RetryClassifier`].
pub struct PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    predicate: F,
}

impl<F> PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> FailureClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn should_trip(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> RetryClassifier for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn is_retryable(&self, ctx: &FailureContext<'_>) -> bool {
        (self.predicate)(ctx)
    }
}

impl<F> std::fmt::Debug for PredicateClassifier<F>
where
    F: Fn(&FailureContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredicateClassifier")
            .field("predicate", &"<closure>")
            .finish()
    }
}

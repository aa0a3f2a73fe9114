//! ResilienceMachines - circuit breakers, bulkheads and retries for async Rust
//!
//! This crate provides the execution core of a resilience layer:
//! - Sliding windows (count- or time-based) that aggregate call outcomes
//! - Circuit breaker state machine (Closed → Open → HalfOpen) with rate thresholds
//! - Bulkheads: a non-blocking semaphore or a bounded worker queue
//! - Retry policies with exponential backoff, jitter and deadlines
//! - A call gate chaining bulkhead → timeout → breaker → retry → fallback
//! - A registry mapping gate names to shared gates
//!
//! # Example
//!
//! ```rust
//! use resilience_machines::{CallContext, CallGate, GateError, Jitter, RetryConfig};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let gate = CallGate::builder("inventory")
//!     .retry(RetryConfig {
//!         max_attempts: 3,
//!         jitter: Jitter::Full,
//!         ..Default::default()
//!     })
//!     .attempt_timeout(Duration::from_secs(2))
//!     .build()
//!     .expect("valid gate");
//!
//! let result: Result<u32, GateError<String>> = gate
//!     .execute(&CallContext::new(), || async { Ok(42) })
//!     .await;
//!
//! assert_eq!(result.unwrap(), 42);
//! # }
//! ```

pub mod builder;
pub mod bulkhead;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod errors;
pub mod gate;
pub mod registry;
pub mod retry;
pub mod window;

pub use builder::CircuitBuilder;
pub use bulkhead::{
    Bulkhead, BulkheadGuard, BulkheadMetrics, JobHandle, QueueBulkhead, QueueError,
    SemaphoreBulkhead,
};
pub use callbacks::{Callbacks, StateTransition};
pub use circuit::{
    Admission, BreakerConfig, BreakerMetrics, BreakerPermit, CallOptions, CircuitBreaker,
    CircuitState, FallbackContext, WindowType,
};
pub use classifier::{
    DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier, RetryClassifier,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use errors::{ConfigError, ExhaustedReason, GateError, RejectionKind};
pub use gate::{CallContext, CallGate, Fallback, GateBuilder, GateMetrics, RetryEvent};
pub use registry::Registry;
pub use retry::{Jitter, RetryConfig, RetryDecision, RetryPolicy, RetryState, StopReason};
pub use window::{CountWindow, SlidingWindow, TimeWindow, WindowSnapshot};

/// Outcome of one guarded attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum Outcome {
    Success,
    Failure,
    /// Succeeded, but slower than the slow-call threshold
    Slow,
    /// Never reached the dependency
    Rejected,
    Timeout,
}

impl Outcome {
    /// Counts toward the failure rate
    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::Timeout)
    }
}

/// A single outcome recorded by a sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub outcome: Outcome,
    pub at: tokio::time::Instant,
    pub duration: std::time::Duration,
}

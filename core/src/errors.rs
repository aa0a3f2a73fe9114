//! Error types for guarded calls and configuration

use crate::CircuitState;
use serde::Serialize;
use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Why the retry engine stopped after a retryable error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExhaustedReason {
    /// `max_attempts` attempts were made
    MaxAttempts,
    /// The next sleep would have overrun the call deadline
    Deadline,
    /// The breaker stopped admitting attempts between retries
    CircuitOpen,
}

impl fmt::Display for ExhaustedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustedReason::MaxAttempts => f.write_str("attempt budget spent"),
            ExhaustedReason::Deadline => f.write_str("deadline reached"),
            ExhaustedReason::CircuitOpen => f.write_str("circuit opened"),
        }
    }
}

/// Classification of a terminal rejection, handed to fallbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectionKind {
    BulkheadFull,
    CircuitOpen,
    RetriesExhausted,
}

/// Errors returned by a guarded call
#[derive(Debug)]
pub enum GateError<E = Box<dyn Error + Send + Sync>> {
    /// Circuit is open (or its half-open probe budget is spent)
    CircuitOpen { gate: String, state: CircuitState },
    /// Bulkhead is at capacity, cannot acquire permit
    BulkheadFull { gate: String, limit: usize },
    /// An attempt ran past its timeout, or the deadline was spent before it started
    Timeout { gate: String, after: Duration },
    /// Retryable failures used up the retry budget; `last` is the final error
    RetriesExhausted {
        gate: String,
        attempts: u32,
        reason: ExhaustedReason,
        last: Box<GateError<E>>,
    },
    /// The caller cancelled the call
    Cancelled { gate: String },
    /// No gate is registered under this key
    UnknownGate(String),
    /// The wrapped operation failed
    Inner(E),
}

impl<E> GateError<E> {
    /// Terminal rejection classification, `None` for errors that are returned as-is
    pub fn rejection_kind(&self) -> Option<RejectionKind> {
        match self {
            GateError::BulkheadFull { .. } => Some(RejectionKind::BulkheadFull),
            GateError::CircuitOpen { .. } => Some(RejectionKind::CircuitOpen),
            GateError::RetriesExhausted { .. } => Some(RejectionKind::RetriesExhausted),
            _ => None,
        }
    }

    /// Borrow the domain error, looking through `RetriesExhausted`
    pub fn inner(&self) -> Option<&E> {
        match self {
            GateError::Inner(e) => Some(e),
            GateError::RetriesExhausted { last, .. } => last.inner(),
            _ => None,
        }
    }

    /// Take the domain error out, looking through `RetriesExhausted`
    pub fn into_inner(self) -> Option<E> {
        match self {
            GateError::Inner(e) => Some(e),
            GateError::RetriesExhausted { last, .. } => (*last).into_inner(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GateError::Timeout { .. })
    }
}

impl<E: fmt::Display> fmt::Display for GateError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::CircuitOpen { gate, state } => {
                write!(f, "Circuit '{}' is rejecting calls (state: {})", gate, state)
            }
            GateError::BulkheadFull { gate, limit } => {
                write!(f, "Gate '{}' bulkhead is full (limit: {})", gate, limit)
            }
            GateError::Timeout { gate, after } => {
                write!(f, "Gate '{}' attempt timed out after {:?}", gate, after)
            }
            GateError::RetriesExhausted {
                gate,
                attempts,
                reason,
                last,
            } => write!(
                f,
                "Gate '{}' gave up after {} attempts ({}): {}",
                gate, attempts, reason, last
            ),
            GateError::Cancelled { gate } => write!(f, "Gate '{}' call cancelled", gate),
            GateError::UnknownGate(key) => write!(f, "No gate registered for '{}'", key),
            GateError::Inner(e) => write!(f, "Call failed: {}", e),
        }
    }
}

impl<E: Error + 'static> Error for GateError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            GateError::Inner(e) => Some(e),
            GateError::RetriesExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Invalid configuration, raised when a breaker, bulkhead or gate is built
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be within {min}..={max} (got {value})")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },

    #[error("{0} must be greater than 0")]
    Zero(&'static str),

    #[error("minimum_number_of_calls ({minimum}) exceeds sliding_window_size ({window})")]
    MinimumCallsExceedWindow { minimum: usize, window: usize },

    #[error("max_delay ({max:?}) is shorter than base_delay ({base:?})")]
    DelayCap { base: Duration, max: Duration },

    #[error("a queue bulkhead needs a running tokio runtime")]
    NoRuntime,

    #[error("gate '{0}' is already registered")]
    DuplicateGate(String),

    #[error("gate '{0}' is not registered")]
    UnregisteredGate(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl fmt::Display for Boom {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("boom")
        }
    }

    impl Error for Boom {}

    #[test]
    fn test_retries_exhausted_keeps_cause() {
        let err: GateError<Boom> = GateError::RetriesExhausted {
            gate: "db".into(),
            attempts: 3,
            reason: ExhaustedReason::MaxAttempts,
            last: Box::new(GateError::Inner(Boom)),
        };

        assert_eq!(err.rejection_kind(), Some(RejectionKind::RetriesExhausted));
        assert!(err.inner().is_some());
        assert_eq!(err.source().map(|s| s.to_string()), Some("Call failed: boom".into()));
        assert_eq!(
            err.to_string(),
            "Gate 'db' gave up after 3 attempts (attempt budget spent): Call failed: boom"
        );
    }

    #[test]
    fn test_rejection_kinds() {
        let open: GateError<Boom> = GateError::CircuitOpen {
            gate: "db".into(),
            state: CircuitState::Open,
        };
        let full: GateError<Boom> = GateError::BulkheadFull {
            gate: "db".into(),
            limit: 4,
        };
        let inner: GateError<Boom> = GateError::Inner(Boom);

        assert_eq!(open.rejection_kind(), Some(RejectionKind::CircuitOpen));
        assert_eq!(full.rejection_kind(), Some(RejectionKind::BulkheadFull));
        assert_eq!(inner.rejection_kind(), None);
        assert!(full.to_string().contains("limit: 4"));
    }

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::OutOfRange {
            field: "failure_rate_threshold",
            min: 0.0,
            max: 100.0,
            value: 120.0,
        };
        assert_eq!(
            err.to_string(),
            "failure_rate_threshold must be within 0..=100 (got 120)"
        );
        assert_eq!(
            ConfigError::Zero("max_attempts").to_string(),
            "max_attempts must be greater than 0"
        );
    }
}

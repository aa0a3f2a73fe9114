//! Builder API for ergonomic circuit breaker configuration

use crate::{
    callbacks::{Callbacks, StateTransition},
    circuit::{BreakerConfig, CircuitBreaker, CircuitContext, WindowType},
    classifier::FailureClassifier,
    clock::{Clock, MonotonicClock},
    errors::ConfigError,
    window::{CountWindow, SlidingWindow, TimeWindow},
};
use std::sync::Arc;
use std::time::Duration;

/// Builder for creating circuit breakers with fluent API
pub struct CircuitBuilder {
    name: String,
    config: BreakerConfig,
    clock: Option<Arc<dyn Clock>>,
    window: Option<Arc<dyn SlidingWindow>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
}

impl CircuitBuilder {
    /// Create a new builder for a circuit with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: BreakerConfig::default(),
            clock: None,
            window: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: BreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the failure rate threshold as a percentage (0-100]
    /// Circuit opens when (failed / total) * 100 >= this value
    pub fn failure_rate_threshold(mut self, percent: f64) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Set the slow-call rate threshold as a percentage (0-100]
    pub fn slow_call_rate_threshold(mut self, percent: f64) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Calls at least this long are recorded as slow
    pub fn slow_call_duration_threshold(mut self, threshold: Duration) -> Self {
        self.config.slow_call_duration_threshold = threshold;
        self
    }

    /// Evaluate rates over the last `size` calls
    ///
    /// Lowers `minimum_calls` to `size` if it was larger.
    pub fn count_window(mut self, size: usize) -> Self {
        self.config.sliding_window_type = WindowType::CountBased;
        self.config.sliding_window_size = size;
        self.config.minimum_number_of_calls = self.config.minimum_number_of_calls.min(size);
        self
    }

    /// Evaluate rates over `buckets` time buckets of `bucket_width` each
    pub fn time_window(mut self, buckets: usize, bucket_width: Duration) -> Self {
        self.config.sliding_window_type = WindowType::TimeBased;
        self.config.sliding_window_size = buckets;
        self.config.bucket_width = bucket_width;
        self
    }

    /// Set minimum number of calls before rates are evaluated
    pub fn minimum_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    /// How long the circuit stays open before probing
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    /// Probes admitted in half-open; all of them must succeed to close
    pub fn permitted_calls_in_half_open(mut self, calls: usize) -> Self {
        self.config.permitted_calls_in_half_open = calls;
        self
    }

    /// Set the jitter factor for the open-state wait (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub fn wait_jitter(mut self, factor: f64) -> Self {
        self.config.wait_jitter_factor = factor;
        self
    }

    /// Time source, mostly useful for tests
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use a custom sliding window instead of one built from the config
    pub fn window(mut self, window: Arc<dyn SlidingWindow>) -> Self {
        self.window = Some(window);
        self
    }

    /// Set a failure classifier to filter which errors should trip the circuit
    ///
    /// The classifier determines whether a given error should count toward
    /// opening the circuit. Use this to ignore "expected" errors like validation
    /// failures or client errors (4xx), while still tripping on server errors (5xx).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use resilience_machines::{CircuitBreaker, PredicateClassifier};
    /// use std::sync::Arc;
    /// use std::time::Duration;
    ///
    /// let circuit = CircuitBreaker::builder("api")
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on slow errors
    ///         ctx.duration > Duration::from_secs(1)
    ///     })))
    ///     .build()
    ///     .unwrap();
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Set callback for every state change
    pub fn on_transition<F>(mut self, f: F) -> Self
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.callbacks.on_transition = Some(Arc::new(f));
        self
    }

    /// Validate the configuration and build the circuit breaker
    pub fn build(self) -> Result<CircuitBreaker, ConfigError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(MonotonicClock));
        let config = self.config;
        let window = match self.window {
            Some(window) => window,
            None => default_window(&config, Arc::clone(&clock))?,
        };

        let context = CircuitContext {
            name: self.name,
            config,
            window,
            clock,
            failure_classifier: self.failure_classifier,
        };

        Ok(CircuitBreaker::with_context_and_callbacks(context, self.callbacks))
    }
}

fn default_window(
    config: &BreakerConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn SlidingWindow>, ConfigError> {
    let window: Arc<dyn SlidingWindow> = match config.sliding_window_type {
        WindowType::CountBased => Arc::new(CountWindow::new(
            config.sliding_window_size,
            config.minimum_number_of_calls,
            clock,
        )?),
        WindowType::TimeBased => Arc::new(TimeWindow::new(
            config.sliding_window_size,
            config.bucket_width,
            config.minimum_number_of_calls,
            clock,
        )?),
    };
    Ok(window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{Admission, CircuitState};
    use crate::clock::ManualClock;

    #[test]
    fn test_builder_defaults() {
        let circuit = CircuitBuilder::new("test").build().unwrap();

        assert_eq!(circuit.state_name(), "Closed");
        assert!(circuit.is_closed());
        assert_eq!(circuit.config().sliding_window_size, 100);
        assert_eq!(circuit.config().failure_rate_threshold, 50.0);
    }

    #[test]
    fn test_builder_custom_config() {
        let circuit = CircuitBuilder::new("test")
            .count_window(20)
            .minimum_calls(10)
            .wait_duration(Duration::from_secs(5))
            .permitted_calls_in_half_open(2)
            .build()
            .unwrap();

        assert!(circuit.is_closed());
        assert_eq!(circuit.config().minimum_number_of_calls, 10);
        assert_eq!(circuit.config().permitted_calls_in_half_open, 2);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let err = CircuitBuilder::new("bad")
            .failure_rate_threshold(0.0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "failure_rate_threshold", .. }));

        let err = CircuitBuilder::new("bad")
            .count_window(10)
            .minimum_calls(20)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::MinimumCallsExceedWindow {
                minimum: 20,
                window: 10
            }
        );

        let err = CircuitBuilder::new("bad")
            .permitted_calls_in_half_open(0)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::Zero("permitted_calls_in_half_open"));
    }

    #[test]
    fn test_builder_time_window() {
        let clock = Arc::new(ManualClock::new());
        let circuit = CircuitBuilder::new("timed")
            .time_window(10, Duration::from_secs(1))
            .minimum_calls(2)
            .clock(clock.clone())
            .build()
            .unwrap();

        for _ in 0..2 {
            if let Admission::Admitted(permit) = circuit.try_acquire() {
                permit.record_failure();
            }
            clock.advance(Duration::from_millis(500));
        }
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[test]
    fn test_builder_with_callbacks() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let opened = Arc::new(AtomicBool::new(false));
        let opened_clone = opened.clone();

        let circuit = CircuitBuilder::new("test")
            .count_window(2)
            .on_open(move |_name| {
                opened_clone.store(true, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        // Trigger failures to open circuit
        let _ = circuit.call(|| Err::<(), _>("error 1"));
        let _ = circuit.call(|| Err::<(), _>("error 2"));

        // Callback should have been triggered
        assert!(opened.load(Ordering::SeqCst));
    }
}

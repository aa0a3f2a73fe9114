//! Circuit breaker implementation using state machines
//!
//! The transition table lives in a single `state_machine!` declaration:
//!
//! | event           | from             | to       | guard          |
//! |-----------------|------------------|----------|----------------|
//! | `trip`          | Closed, HalfOpen | Open     | `should_open`  |
//! | `attempt_reset` | Open             | HalfOpen | `wait_elapsed` |
//! | `close`         | HalfOpen         | Closed   | `should_close` |
//!
//! The machine sits behind one mutex, so every read-then-transition is a
//! single critical section and transitions are linearizable.

use crate::callbacks::{Callbacks, StateTransition};
use crate::classifier::{FailureClassifier, FailureContext};
use crate::clock::{Clock, MonotonicClock};
use crate::errors::{ConfigError, GateError, RejectionKind};
use crate::window::{CountWindow, SlidingWindow, WindowSnapshot};
use crate::Outcome;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use state_machines::state_machine;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Externally visible breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_machine(name: &str) -> Self {
        match name {
            "Closed" => CircuitState::Closed,
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            other => unreachable!("circuit machine has no state '{}'", other),
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
        })
    }
}

/// Sliding window policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WindowType {
    /// Last `sliding_window_size` calls
    #[default]
    CountBased,
    /// Last `sliding_window_size` buckets of `bucket_width` each
    TimeBased,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Failure percentage (0-100] at which the circuit opens
    pub failure_rate_threshold: f64,

    /// Slow-call percentage (0-100] at which the circuit opens
    pub slow_call_rate_threshold: f64,

    /// Calls lasting at least this long count as slow
    pub slow_call_duration_threshold: Duration,

    pub sliding_window_type: WindowType,

    /// Calls (count-based) or buckets (time-based) kept in the window
    pub sliding_window_size: usize,

    /// Bucket width for time-based windows
    pub bucket_width: Duration,

    /// Rates are not evaluated below this many calls
    pub minimum_number_of_calls: usize,

    /// How long the circuit stays open before admitting probes
    pub wait_duration_in_open_state: Duration,

    /// Probes admitted while half-open; all must succeed to close
    pub permitted_calls_in_half_open: usize,

    /// Jitter factor for the open-state wait (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub wait_jitter_factor: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_type: WindowType::CountBased,
            sliding_window_size: 100,
            bucket_width: Duration::from_secs(1),
            minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open: 10,
            wait_jitter_factor: 0.0,
        }
    }
}

impl BreakerConfig {
    /// Reject configurations the breaker cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;

        if self.sliding_window_size == 0 {
            return Err(ConfigError::Zero("sliding_window_size"));
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::Zero("minimum_number_of_calls"));
        }
        if self.permitted_calls_in_half_open == 0 {
            return Err(ConfigError::Zero("permitted_calls_in_half_open"));
        }
        match self.sliding_window_type {
            WindowType::CountBased if self.minimum_number_of_calls > self.sliding_window_size => {
                return Err(ConfigError::MinimumCallsExceedWindow {
                    minimum: self.minimum_number_of_calls,
                    window: self.sliding_window_size,
                });
            }
            WindowType::TimeBased if self.bucket_width.is_zero() => {
                return Err(ConfigError::Zero("bucket_width"));
            }
            _ => {}
        }
        if !(0.0..=1.0).contains(&self.wait_jitter_factor) {
            return Err(ConfigError::OutOfRange {
                field: "wait_jitter_factor",
                min: 0.0,
                max: 1.0,
                value: self.wait_jitter_factor,
            });
        }
        Ok(())
    }
}

fn percentage(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            min: 0.0,
            max: 100.0,
            value,
        })
    }
}

/// Context provided to fallback closures on terminal rejection
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Circuit (or gate) name
    pub circuit_name: String,
    /// What rejected the call
    pub kind: RejectionKind,
    /// Breaker state when the call was rejected
    pub state: CircuitState,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(&FallbackContext) -> Result<T, E> + Send>;

/// Options for synchronous breaker calls
pub struct CallOptions<T, E> {
    /// Optional fallback function called when the circuit rejects the call
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&FallbackContext) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Type alias for callable function
pub type CallableFn<T, E> = Box<dyn FnOnce() -> Result<T, E>>;

/// Trait for converting into CallOptions - allows flexible call() API
pub trait IntoCallOptions<T, E> {
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>);
}

impl<T, E, F> IntoCallOptions<T, E> for F
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self), CallOptions::default())
    }
}

impl<T, E, F> IntoCallOptions<T, E> for (F, CallOptions<T, E>)
where
    F: FnOnce() -> Result<T, E> + 'static,
{
    fn into_call_options(self) -> (CallableFn<T, E>, CallOptions<T, E>) {
        (Box::new(self.0), self.1)
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: BreakerConfig,
    pub window: Arc<dyn SlidingWindow>,
    pub clock: Arc<dyn Clock>,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        let config = BreakerConfig::default();
        let clock: Arc<dyn Clock> = Arc::new(MonotonicClock);
        Self {
            name: String::new(),
            window: Arc::new(CountWindow::with_capacity(
                config.sliding_window_size,
                config.minimum_number_of_calls,
                Arc::clone(&clock),
            )),
            config,
            clock,
            failure_classifier: None,
        }
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("window", &self.window)
            .field("clock", &self.clock)
            .field(
                "failure_classifier",
                &self
                    .failure_classifier
                    .as_ref()
                    .map(|_| "<dyn FailureClassifier>"),
            )
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: Option<Instant>,
    /// Wait before probing, jitter already applied
    pub wait: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// Probes admitted and not abandoned
    pub admitted: usize,
    /// Probes that completed successfully
    pub succeeded: usize,
    pub probe_failed: bool,
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

impl Circuit<Closed> {
    /// Failure or slow-call rate over the window reached its threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        let snapshot = ctx.window.snapshot();
        if snapshot.insufficient_data {
            return false;
        }

        snapshot.failure_rate >= ctx.config.failure_rate_threshold
            || snapshot.slow_call_rate >= ctx.config.slow_call_rate_threshold
    }
}

impl Circuit<HalfOpen> {
    /// Any failed probe reopens the circuit
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.probe_failed)
    }

    /// Every permitted probe came back healthy
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open().is_some_and(|data| {
            !data.probe_failed && data.succeeded >= ctx.config.permitted_calls_in_half_open
        })
    }
}

impl Circuit<Open> {
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .and_then(|data| {
                data.opened_at
                    .map(|at| ctx.clock.elapsed_since(at) >= data.wait)
            })
            .unwrap_or(true)
    }
}

/// Why admission was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// `Open`, or `HalfOpen` when the probe budget is spent
    pub state: CircuitState,
    /// Time left before the circuit starts probing, when known
    pub retry_after: Option<Duration>,
}

/// Result of an admission check
#[derive(Debug)]
pub enum Admission<'a> {
    Admitted(BreakerPermit<'a>),
    Rejected(Rejection),
}

/// Read-only breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_rate: f64,
    pub slow_call_rate: f64,
    /// Completed calls since construction
    pub total_calls: u64,
    /// Calls currently inside the sliding window
    pub buffered_calls: usize,
    pub rejected_calls: u64,
    pub transitions: u64,
}

struct Core {
    machine: DynamicCircuit,
    /// Bumped on every transition; outcomes from older epochs are ignored
    epoch: u64,
}

/// Circuit breaker public API
pub struct CircuitBreaker {
    core: Mutex<Core>,
    context: CircuitContext,
    callbacks: Callbacks,
    total_calls: AtomicU64,
    transitions: AtomicU64,
}

impl CircuitBreaker {
    /// Create a breaker with a count/time window derived from `config`
    /// (use builder() for more options)
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Result<Self, ConfigError> {
        crate::builder::CircuitBuilder::new(name).config(config).build()
    }

    /// Create a circuit breaker with custom context and callbacks (used by builder)
    pub(crate) fn with_context_and_callbacks(
        context: CircuitContext,
        callbacks: Callbacks,
    ) -> Self {
        let machine = DynamicCircuit::new(context.clone());

        Self {
            core: Mutex::new(Core { machine, epoch: 0 }),
            context,
            callbacks,
            total_calls: AtomicU64::new(0),
            transitions: AtomicU64::new(0),
        }
    }

    pub fn builder(name: impl Into<String>) -> crate::builder::CircuitBuilder {
        crate::builder::CircuitBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.context.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.context.config
    }

    /// Ask to run one call
    ///
    /// An open circuit whose wait has elapsed moves to half-open first, so
    /// the caller may itself become a probe.
    pub fn try_acquire(&self) -> Admission<'_> {
        let (admission, transition) = {
            let mut core = self.core.lock();
            let transition = self.advance_open(&mut core);
            let epoch = core.epoch;

            let admission = match self.state_of(&core) {
                CircuitState::Closed => Admission::Admitted(self.permit(epoch, false)),
                CircuitState::Open => Admission::Rejected(Rejection {
                    state: CircuitState::Open,
                    retry_after: core.machine.open_data().and_then(|data| {
                        data.opened_at.map(|at| {
                            data.wait.saturating_sub(self.context.clock.elapsed_since(at))
                        })
                    }),
                }),
                CircuitState::HalfOpen => {
                    let permitted = self.context.config.permitted_calls_in_half_open;
                    match core.machine.half_open_data_mut() {
                        Some(data) if data.admitted < permitted => {
                            data.admitted += 1;
                            Admission::Admitted(self.permit(epoch, true))
                        }
                        _ => Admission::Rejected(Rejection {
                            state: CircuitState::HalfOpen,
                            retry_after: None,
                        }),
                    }
                }
            };
            (admission, transition)
        };

        if let Some(transition) = transition {
            self.callbacks.fire(&transition);
        }
        if let Admission::Rejected(rejection) = &admission {
            self.context.window.record(Outcome::Rejected, Duration::ZERO);
            debug!(circuit = %self.context.name, state = %rejection.state, "call rejected");
        }
        admission
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Accepts either:
    /// - A plain closure: `circuit.call(|| api_request())`
    /// - A closure with options:
    ///   `circuit.call((|| api_request(), CallOptions::new().with_fallback(...)))`
    pub fn call<I, T, E: 'static>(&self, input: I) -> Result<T, GateError<E>>
    where
        I: IntoCallOptions<T, E>,
    {
        let (f, options) = input.into_call_options();

        match self.try_acquire() {
            Admission::Rejected(rejection) => {
                if let Some(fallback) = options.fallback {
                    let ctx = FallbackContext {
                        circuit_name: self.context.name.clone(),
                        kind: RejectionKind::CircuitOpen,
                        state: rejection.state,
                    };
                    return fallback(&ctx).map_err(GateError::Inner);
                }

                Err(GateError::CircuitOpen {
                    gate: self.context.name.clone(),
                    state: rejection.state,
                })
            }
            Admission::Admitted(permit) => match f() {
                Ok(val) => {
                    permit.record_success();
                    Ok(val)
                }
                Err(e) => {
                    permit.record_error(&e);
                    Err(GateError::Inner(e))
                }
            },
        }
    }

    /// Current state, without driving any transition
    pub fn state(&self) -> CircuitState {
        self.state_of(&self.core.lock())
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    pub fn state_name(&self) -> &'static str {
        self.core.lock().machine.current_state()
    }

    /// Snapshot of the sliding window
    pub fn window_snapshot(&self) -> WindowSnapshot {
        self.context.window.snapshot()
    }

    /// Most recent recorded events, oldest first
    pub fn event_log(&self, limit: usize) -> Vec<crate::Event> {
        self.context.window.event_log(limit)
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let state = self.state();
        let snapshot = self.context.window.snapshot();

        BreakerMetrics {
            name: self.context.name.clone(),
            state,
            failure_rate: snapshot.failure_rate,
            slow_call_rate: snapshot.slow_call_rate,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            buffered_calls: snapshot.total_calls,
            rejected_calls: snapshot.rejected_calls,
            transitions: self.transitions.load(Ordering::Relaxed),
        }
    }

    /// Clear all events and reset circuit to Closed state
    pub fn reset(&self) {
        let transition = {
            let mut core = self.core.lock();
            let from = self.state_of(&core);
            self.context.window.clear();
            core.machine = DynamicCircuit::new(self.context.clone());
            core.epoch += 1;
            (from != CircuitState::Closed).then(|| self.transitioned(from, CircuitState::Closed))
        };

        if let Some(transition) = transition {
            self.callbacks.fire(&transition);
        }
    }

    fn permit(&self, epoch: u64, probe: bool) -> BreakerPermit<'_> {
        BreakerPermit {
            breaker: self,
            epoch,
            probe,
            started: self.context.clock.now(),
            completed: false,
        }
    }

    fn state_of(&self, core: &Core) -> CircuitState {
        CircuitState::from_machine(core.machine.current_state())
    }

    /// Open -> HalfOpen once the wait has elapsed
    fn advance_open(&self, core: &mut Core) -> Option<StateTransition> {
        if self.state_of(core) != CircuitState::Open
            || core.machine.handle(CircuitEvent::AttemptReset).is_err()
        {
            return None;
        }

        core.epoch += 1;
        Some(self.transitioned(CircuitState::Open, CircuitState::HalfOpen))
    }

    fn on_result(&self, epoch: u64, probe: bool, outcome: Outcome, duration: Duration) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let transition = {
            let mut core = self.core.lock();
            if core.epoch != epoch {
                debug!(
                    circuit = %self.context.name,
                    ?outcome,
                    "ignoring outcome from a previous state"
                );
                return;
            }

            match self.state_of(&core) {
                CircuitState::Closed => {
                    self.context.window.record(outcome, duration);
                    self.try_trip(&mut core, CircuitState::Closed)
                }
                CircuitState::HalfOpen if probe => {
                    if let Some(data) = core.machine.half_open_data_mut() {
                        if outcome == Outcome::Success {
                            data.succeeded += 1;
                        } else {
                            data.probe_failed = true;
                        }
                    }

                    if let Some(transition) = self.try_trip(&mut core, CircuitState::HalfOpen) {
                        Some(transition)
                    } else if core.machine.handle(CircuitEvent::Close).is_ok() {
                        self.context.window.clear();
                        core.epoch += 1;
                        Some(self.transitioned(CircuitState::HalfOpen, CircuitState::Closed))
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(transition) = transition {
            self.callbacks.fire(&transition);
        }
    }

    /// A probe went away without an outcome; hand its slot back
    fn release_probe(&self, epoch: u64) {
        let mut core = self.core.lock();
        if core.epoch != epoch {
            return;
        }
        if let Some(data) = core.machine.half_open_data_mut() {
            data.admitted = data.admitted.saturating_sub(1);
        }
    }

    fn try_trip(&self, core: &mut Core, from: CircuitState) -> Option<StateTransition> {
        core.machine.handle(CircuitEvent::Trip).ok()?;

        let wait = self.open_wait();
        let now = self.context.clock.now();
        if let Some(data) = core.machine.open_data_mut() {
            data.opened_at = Some(now);
            data.wait = wait;
        }
        core.epoch += 1;
        Some(self.transitioned(from, CircuitState::Open))
    }

    /// Open-state wait with jitter applied via chrono-machines
    fn open_wait(&self) -> Duration {
        let wait = self.context.config.wait_duration_in_open_state;
        let jitter = self.context.config.wait_jitter_factor;
        if jitter <= 0.0 {
            return wait;
        }

        let wait_ms = wait.as_millis() as u64;
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: wait_ms,
            multiplier: 1.0,
            max_delay_ms: wait_ms,
        };
        Duration::from_millis(policy.calculate_delay(1, jitter))
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) -> StateTransition {
        self.transitions.fetch_add(1, Ordering::Relaxed);
        let name = &self.context.name;
        match to {
            CircuitState::Open => warn!(circuit = %name, %from, "circuit opened"),
            CircuitState::HalfOpen => info!(circuit = %name, "circuit half-open, probing"),
            CircuitState::Closed => info!(circuit = %name, %from, "circuit closed"),
        }

        StateTransition {
            circuit: name.clone(),
            from,
            to,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.context.name)
            .field("state", &self.state())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

/// Admission ticket for one call
///
/// Report the outcome through one of the `record_*` methods. Dropping the
/// permit without an outcome (cancellation, panic) records nothing and
/// returns a half-open probe slot to the breaker.
#[must_use = "report the call outcome or drop the permit to abandon it"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    epoch: u64,
    probe: bool,
    started: Instant,
    completed: bool,
}

impl BreakerPermit<'_> {
    /// Admitted as a half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn elapsed(&self) -> Duration {
        self.breaker.context.clock.elapsed_since(self.started)
    }

    /// Successful call; recorded as `Slow` past the slow-call threshold
    pub fn record_success(mut self) {
        let duration = self.elapsed();
        let outcome = if duration >= self.breaker.context.config.slow_call_duration_threshold {
            Outcome::Slow
        } else {
            Outcome::Success
        };
        self.finish(outcome, duration);
    }

    pub fn record_failure(mut self) {
        let duration = self.elapsed();
        self.finish(Outcome::Failure, duration);
    }

    pub fn record_timeout(mut self) {
        let duration = self.elapsed();
        self.finish(Outcome::Timeout, duration);
    }

    /// Run the failure classifier on `error` and record accordingly
    ///
    /// Returns whether the error counted as a failure.
    pub fn record_error<E: Any>(self, error: &E) -> bool {
        let trips = self
            .breaker
            .context
            .failure_classifier
            .as_ref()
            .is_none_or(|classifier| {
                classifier.should_trip(&FailureContext {
                    circuit_name: &self.breaker.context.name,
                    error: error as &dyn Any,
                    duration: self.elapsed(),
                })
            });

        if trips {
            self.record_failure();
        } else {
            self.record_success();
        }
        trips
    }

    fn finish(&mut self, outcome: Outcome, duration: Duration) {
        self.completed = true;
        self.breaker
            .on_result(self.epoch, self.probe, outcome, duration);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.completed && self.probe {
            self.breaker.release_probe(self.epoch);
        }
    }
}

impl fmt::Debug for BreakerPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerPermit")
            .field("circuit", &self.breaker.context.name)
            .field("epoch", &self.epoch)
            .field("probe", &self.probe)
            .finish()
    }
}

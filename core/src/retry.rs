//! Retry policy engine
//!
//! Exponential backoff capped at `max_delay`, with optional jitter and an
//! optional overall time budget. The engine only decides; sleeping and
//! re-running the attempt is the caller's job.

use crate::errors::ConfigError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Randomisation applied on top of the exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Jitter {
    /// Exact backoff
    None,
    /// Uniform in `[0, backoff]`
    #[default]
    Full,
    /// Uniform in `[base_delay, previous * 3]`, independent of the attempt number
    Decorrelated,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, initial attempt included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// No single delay exceeds this
    pub max_delay: Duration,
    pub jitter: Jitter,
    /// Overall budget measured from the first attempt
    pub max_elapsed: Option<Duration>,
    /// Treat attempt timeouts as retryable
    pub retry_on_timeout: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Jitter::Full,
            max_elapsed: None,
            retry_on_timeout: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt, never retried
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if !(self.multiplier >= 1.0 && self.multiplier.is_finite()) {
            return Err(ConfigError::OutOfRange {
                field: "multiplier",
                min: 1.0,
                max: f64::MAX,
                value: self.multiplier,
            });
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::DelayCap {
                base: self.base_delay,
                max: self.max_delay,
            });
        }
        Ok(())
    }
}

/// Why the engine stopped retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NonRetryable,
    AttemptsExhausted,
    /// The next sleep would end past the deadline
    DeadlineExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    Stop(StopReason),
}

/// Per-call retry bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts started so far
    pub attempt: u32,
    pub cumulative_delay: Duration,
    pub deadline: Option<Instant>,
    pub last_delay: Option<Duration>,
}

impl RetryState {
    pub fn new(deadline: Option<Instant>) -> Self {
        Self {
            attempt: 0,
            cumulative_delay: Duration::ZERO,
            deadline,
            last_delay: None,
        }
    }

    /// Count a new attempt and return its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }
}

/// Validated retry configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            config: RetryConfig::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Fresh state for one logical call
    ///
    /// The effective deadline is the earlier of the caller's deadline and
    /// `now + max_elapsed`.
    pub fn start(&self, now: Instant, deadline: Option<Instant>) -> RetryState {
        let budget = self.config.max_elapsed.map(|elapsed| now + elapsed);
        let deadline = match (deadline, budget) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        RetryState::new(deadline)
    }

    /// Un-jittered backoff after `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay;
        if base.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = base.as_nanos() as f64 * self.config.multiplier.powi(exponent);
        let cap = self.config.max_delay.as_nanos() as f64;
        Duration::from_nanos(nanos.min(cap) as u64)
    }

    /// Delay to sleep after `attempt` failed, jitter included
    pub fn next_delay(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let delay = match self.config.jitter {
            Jitter::None => self.backoff(attempt),
            Jitter::Full => {
                let backoff = nanos(self.backoff(attempt));
                Duration::from_nanos(rand::rng().random_range(0..=backoff))
            }
            Jitter::Decorrelated => {
                let base = nanos(self.config.base_delay);
                let previous = previous.map_or(base, nanos);
                let upper = previous.saturating_mul(3).max(base);
                Duration::from_nanos(rand::rng().random_range(base..=upper))
            }
        };

        delay.min(self.config.max_delay)
    }

    /// Decide what happens after a failed attempt
    ///
    /// On `Retry` the state already carries the chosen delay.
    pub fn decide(&self, state: &mut RetryState, retryable: bool, now: Instant) -> RetryDecision {
        if !retryable {
            return RetryDecision::Stop(StopReason::NonRetryable);
        }
        if state.attempt >= self.config.max_attempts {
            return RetryDecision::Stop(StopReason::AttemptsExhausted);
        }

        let delay = self.next_delay(state.attempt, state.last_delay);
        if let Some(deadline) = state.deadline
            && now + delay > deadline
        {
            return RetryDecision::Stop(StopReason::DeadlineExceeded);
        }

        state.last_delay = Some(delay);
        state.cumulative_delay += delay;
        RetryDecision::Retry(delay)
    }
}

fn nanos(delay: Duration) -> u64 {
    u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX)
}

//! Sliding window aggregation of call outcomes
//!
//! This module provides the two window policies used by circuit breakers:
//! - `CountWindow`: fixed ring of the last N outcomes
//! - `TimeWindow`: ring of fixed-width time buckets, evicted lazily
//!
//! Both are lock-protected so concurrent writers never lose updates. Readers
//! see a consistent snapshot of the ring but no ordering is promised relative
//! to writers racing with them.

use crate::clock::Clock;
use crate::errors::ConfigError;
use crate::{Event, Outcome};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Aggregated view over the current window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSnapshot {
    /// Calls inside the window (rejections excluded)
    pub total_calls: usize,
    /// Calls that ended in `Failure` or `Timeout`
    pub failed_calls: usize,
    /// Calls that ended in `Slow`
    pub slow_calls: usize,
    /// Calls rejected before reaching the dependency, all-time
    pub rejected_calls: u64,
    /// Percentage of failed calls (0-100)
    pub failure_rate: f64,
    /// Percentage of slow calls (0-100)
    pub slow_call_rate: f64,
    /// Not enough calls yet for the rates to be meaningful
    pub insufficient_data: bool,
}

impl WindowSnapshot {
    fn from_counts(
        total: usize,
        failed: usize,
        slow: usize,
        rejected: u64,
        insufficient_data: bool,
    ) -> Self {
        let rate = |n: usize| {
            if total == 0 {
                0.0
            } else {
                n as f64 * 100.0 / total as f64
            }
        };

        Self {
            total_calls: total,
            failed_calls: failed,
            slow_calls: slow,
            rejected_calls: rejected,
            failure_rate: rate(failed),
            slow_call_rate: rate(slow),
            insufficient_data,
        }
    }
}

/// Abstract window over recent call outcomes
pub trait SlidingWindow: Send + Sync + std::fmt::Debug {
    /// Record the outcome of one call
    fn record(&self, outcome: Outcome, duration: Duration);

    /// Compute counts and rates over the current window
    fn snapshot(&self) -> WindowSnapshot;

    /// Drop every recorded outcome
    fn clear(&self);

    /// Most recent events, oldest first (empty for aggregating windows)
    fn event_log(&self, _limit: usize) -> Vec<Event> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
struct CountRing {
    entries: VecDeque<Event>,
    failed: usize,
    slow: usize,
}

impl CountRing {
    fn adjust(&mut self, outcome: Outcome, add: bool) {
        let counter = match outcome {
            o if o.is_failure() => &mut self.failed,
            Outcome::Slow => &mut self.slow,
            _ => return,
        };
        if add {
            *counter += 1;
        } else {
            *counter -= 1;
        }
    }
}

/// Count-based window keeping the last `capacity` outcomes
///
/// Rates are reported only once the ring has been filled and at least
/// `minimum_calls` outcomes are present.
#[derive(Debug)]
pub struct CountWindow {
    capacity: usize,
    minimum_calls: usize,
    ring: Mutex<CountRing>,
    rejected: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl CountWindow {
    pub fn new(
        capacity: usize,
        minimum_calls: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::Zero("sliding_window_size"));
        }
        Ok(Self::with_capacity(capacity, minimum_calls, clock))
    }

    /// Caller guarantees `capacity > 0`
    pub(crate) fn with_capacity(
        capacity: usize,
        minimum_calls: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            capacity,
            minimum_calls,
            ring: Mutex::new(CountRing {
                entries: VecDeque::with_capacity(capacity),
                ..Default::default()
            }),
            rejected: AtomicU64::new(0),
            clock,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl SlidingWindow for CountWindow {
    fn record(&self, outcome: Outcome, duration: Duration) {
        if outcome == Outcome::Rejected {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut ring = self.ring.lock();
        if ring.entries.len() == self.capacity
            && let Some(evicted) = ring.entries.pop_front()
        {
            ring.adjust(evicted.outcome, false);
        }

        ring.adjust(outcome, true);
        ring.entries.push_back(Event {
            outcome,
            at: self.clock.now(),
            duration,
        });
    }

    fn snapshot(&self) -> WindowSnapshot {
        let ring = self.ring.lock();
        let total = ring.entries.len();
        let insufficient = total < self.capacity || total < self.minimum_calls;

        WindowSnapshot::from_counts(
            total,
            ring.failed,
            ring.slow,
            self.rejected.load(Ordering::Relaxed),
            insufficient,
        )
    }

    fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.entries.clear();
        ring.failed = 0;
        ring.slow = 0;
    }

    fn event_log(&self, limit: usize) -> Vec<Event> {
        let ring = self.ring.lock();
        let start = ring.entries.len().saturating_sub(limit);
        ring.entries.iter().skip(start).cloned().collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    index: u64,
    total: usize,
    failed: usize,
    slow: usize,
}

/// Time-based window made of `buckets` slots of `bucket_width` each
///
/// A bucket is reused once its index falls out of the window; stale buckets
/// are zeroed whenever the ring is touched.
#[derive(Debug)]
pub struct TimeWindow {
    bucket_width: Duration,
    minimum_calls: usize,
    origin: Instant,
    buckets: Mutex<Vec<Bucket>>,
    rejected: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl TimeWindow {
    pub fn new(
        buckets: usize,
        bucket_width: Duration,
        minimum_calls: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if buckets == 0 {
            return Err(ConfigError::Zero("sliding_window_size"));
        }
        if bucket_width.is_zero() {
            return Err(ConfigError::Zero("bucket_width"));
        }
        Ok(Self {
            bucket_width,
            minimum_calls,
            origin: clock.now(),
            buckets: Mutex::new(vec![Bucket::default(); buckets]),
            rejected: AtomicU64::new(0),
            clock,
        })
    }

    /// Total span covered by the window
    pub fn span(&self) -> Duration {
        self.bucket_width * self.buckets.lock().len() as u32
    }

    fn current_index(&self) -> u64 {
        let elapsed = self.clock.elapsed_since(self.origin).as_nanos();
        (elapsed / self.bucket_width.as_nanos().max(1)) as u64
    }

    fn evict_stale(buckets: &mut [Bucket], current: u64) {
        let len = buckets.len() as u64;
        for bucket in buckets.iter_mut() {
            if current.saturating_sub(bucket.index) >= len {
                *bucket = Bucket::default();
            }
        }
    }
}

impl SlidingWindow for TimeWindow {
    fn record(&self, outcome: Outcome, _duration: Duration) {
        if outcome == Outcome::Rejected {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let current = self.current_index();
        let mut buckets = self.buckets.lock();
        Self::evict_stale(&mut buckets, current);

        let slot = (current % buckets.len() as u64) as usize;
        let bucket = &mut buckets[slot];
        if bucket.index != current {
            *bucket = Bucket {
                index: current,
                ..Default::default()
            };
        }

        bucket.total += 1;
        if outcome.is_failure() {
            bucket.failed += 1;
        } else if outcome == Outcome::Slow {
            bucket.slow += 1;
        }
    }

    fn snapshot(&self) -> WindowSnapshot {
        let current = self.current_index();
        let mut buckets = self.buckets.lock();
        Self::evict_stale(&mut buckets, current);

        let (total, failed, slow) = buckets.iter().fold((0, 0, 0), |acc, b| {
            (acc.0 + b.total, acc.1 + b.failed, acc.2 + b.slow)
        });

        WindowSnapshot::from_counts(
            total,
            failed,
            slow,
            self.rejected.load(Ordering::Relaxed),
            total < self.minimum_calls,
        )
    }

    fn clear(&self) {
        let mut buckets = self.buckets.lock();
        buckets.fill(Bucket::default());
    }
}

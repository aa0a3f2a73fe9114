//! Bulkhead implementation for concurrency limiting
//!
//! Two strategies are provided:
//! - `SemaphoreBulkhead`: lock-free permit counter, the caller runs the work
//! - `QueueBulkhead`: a fixed pool of tokio workers fed by a bounded queue
//!
//! Both reject instead of queueing without bound, and both count rejections.

use crate::errors::ConfigError;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc, oneshot};
use tracing::{debug, error};

/// Read-only bulkhead metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BulkheadMetrics {
    pub max_concurrent: usize,
    pub available: usize,
    pub in_flight: usize,
    /// Callers waiting for a permit, or tasks waiting for a worker
    pub queue_depth: usize,
    pub rejected: u64,
}

/// A semaphore-based bulkhead for limiting concurrent operations
///
/// Bulkheading prevents resource exhaustion by rejecting requests
/// when a maximum concurrency limit is reached.
#[derive(Debug)]
pub struct SemaphoreBulkhead {
    /// Maximum number of concurrent permits
    limit: usize,
    /// Current number of acquired permits
    acquired: AtomicUsize,
    waiting: AtomicUsize,
    rejected: AtomicU64,
    released: Notify,
}

impl SemaphoreBulkhead {
    /// Create a new bulkhead with the given concurrency limit
    pub fn new(limit: usize) -> Result<Self, ConfigError> {
        if limit == 0 {
            return Err(ConfigError::Zero("max_concurrent_calls"));
        }

        Ok(Self {
            limit,
            acquired: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
            released: Notify::new(),
        })
    }

    /// Try to acquire a permit without blocking
    ///
    /// Returns `Some(BulkheadGuard)` if a permit was acquired, or `None` if
    /// the bulkhead is at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BulkheadGuard> {
        let guard = self.take();
        if guard.is_none() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
        guard
    }

    /// Acquire a permit, waiting up to `max_wait` for one to be released
    pub async fn acquire(self: &Arc<Self>, max_wait: Duration) -> Option<BulkheadGuard> {
        if let Some(guard) = self.take() {
            return Some(guard);
        }

        if !max_wait.is_zero() {
            let _waiting = WaitingGuard::enter(&self.waiting);
            if let Ok(guard) = tokio::time::timeout(max_wait, self.wait_for_permit()).await {
                return Some(guard);
            }
        }

        self.rejected.fetch_add(1, Ordering::Relaxed);
        None
    }

    async fn wait_for_permit(self: &Arc<Self>) -> BulkheadGuard {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            if let Some(guard) = self.take() {
                return guard;
            }
            notified.await;
        }
    }

    fn take(self: &Arc<Self>) -> Option<BulkheadGuard> {
        let mut current = self.acquired.load(Ordering::Acquire);

        loop {
            if current >= self.limit {
                return None;
            }

            match self.acquired.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(BulkheadGuard {
                        semaphore: Arc::clone(self),
                    });
                }
                Err(actual) => {
                    // Another thread modified the counter, try again
                    current = actual;
                }
            }
        }
    }

    /// Get the current number of acquired permits
    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Acquire)
    }

    /// Get the maximum number of permits (bulkhead limit)
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Get the number of available permits
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.acquired())
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            max_concurrent: self.limit,
            available: self.available(),
            in_flight: self.acquired(),
            queue_depth: self.waiting.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Release a permit (called by BulkheadGuard on drop)
    fn release(&self) {
        let released = self
            .acquired
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

        debug_assert!(released.is_ok(), "bulkhead permit released twice");
        if released.is_err() {
            error!(limit = self.limit, "bulkhead release without a matching acquire");
            return;
        }
        self.released.notify_one();
    }
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Guard that releases a bulkhead permit when dropped
///
/// This ensures that permits are always released, even if the guarded
/// operation panics or its future is cancelled.
#[derive(Debug)]
pub struct BulkheadGuard {
    semaphore: Arc<SemaphoreBulkhead>,
}

impl Drop for BulkheadGuard {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

/// Why a queue bulkhead did not run a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was at capacity
    Full,
    /// The workers are gone (runtime shutting down)
    Closed,
}

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Default)]
struct QueueStats {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    rejected: AtomicU64,
}

/// Fixed worker pool behind a bounded queue
///
/// Workers stop once the bulkhead is dropped and the queue drains.
#[derive(Debug)]
pub struct QueueBulkhead {
    max_workers: usize,
    queue_capacity: usize,
    jobs: mpsc::Sender<Job>,
    stats: Arc<QueueStats>,
}

impl QueueBulkhead {
    /// Spawn `max_workers` workers on the current tokio runtime
    pub fn new(max_workers: usize, queue_capacity: usize) -> Result<Self, ConfigError> {
        if max_workers == 0 {
            return Err(ConfigError::Zero("max_workers"));
        }
        if queue_capacity == 0 {
            return Err(ConfigError::Zero("queue_capacity"));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let (jobs, receiver) = mpsc::channel(queue_capacity);
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let stats = Arc::new(QueueStats::default());

        for id in 0..max_workers {
            runtime.spawn(worker(id, Arc::clone(&receiver), Arc::clone(&stats)));
        }

        Ok(Self {
            max_workers,
            queue_capacity,
            jobs,
            stats,
        })
    }

    /// Enqueue `task` or reject it when the queue is full
    ///
    /// The returned handle resolves to the task's output. A panic inside the
    /// task is resumed on whoever joins the handle.
    pub fn submit<F, Fut, T>(&self, task: F) -> Result<JobHandle<T>, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let result = AssertUnwindSafe(async move { task().await })
                .catch_unwind()
                .await;
            if result.is_err() {
                error!("bulkhead task panicked");
            }
            // The caller may have stopped waiting
            let _ = tx.send(result);
        });

        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.jobs.try_send(job) {
            self.stats.queued.fetch_sub(1, Ordering::AcqRel);
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(match err {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            });
        }

        Ok(JobHandle { result: rx })
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        let in_flight = self.stats.in_flight.load(Ordering::Acquire);
        BulkheadMetrics {
            max_concurrent: self.max_workers,
            available: self.max_workers.saturating_sub(in_flight),
            in_flight,
            queue_depth: self.stats.queued.load(Ordering::Acquire),
            rejected: self.stats.rejected.load(Ordering::Relaxed),
        }
    }
}

async fn worker(id: usize, jobs: Arc<AsyncMutex<mpsc::Receiver<Job>>>, stats: Arc<QueueStats>) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else { break };

        stats.queued.fetch_sub(1, Ordering::AcqRel);
        stats.in_flight.fetch_add(1, Ordering::AcqRel);
        job.await;
        stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(worker = id, "bulkhead worker stopped");
}

/// Pending result of a queued task
#[derive(Debug)]
pub struct JobHandle<T> {
    result: oneshot::Receiver<std::thread::Result<T>>,
}

impl<T> JobHandle<T> {
    /// Wait for the task to finish
    pub async fn join(self) -> Result<T, QueueError> {
        match self.result.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => std::panic::resume_unwind(panic),
            Err(_) => Err(QueueError::Closed),
        }
    }
}

/// Bulkhead strategy used by a gate
#[derive(Debug, Clone)]
pub enum Bulkhead {
    Semaphore {
        permits: Arc<SemaphoreBulkhead>,
        max_wait: Duration,
    },
    Queue(Arc<QueueBulkhead>),
}

impl Bulkhead {
    pub fn semaphore(max_concurrent_calls: usize, max_wait: Duration) -> Result<Self, ConfigError> {
        Ok(Bulkhead::Semaphore {
            permits: Arc::new(SemaphoreBulkhead::new(max_concurrent_calls)?),
            max_wait,
        })
    }

    pub fn queue(max_workers: usize, queue_capacity: usize) -> Result<Self, ConfigError> {
        Ok(Bulkhead::Queue(Arc::new(QueueBulkhead::new(
            max_workers,
            queue_capacity,
        )?)))
    }

    /// Concurrency limit
    pub fn limit(&self) -> usize {
        match self {
            Bulkhead::Semaphore { permits, .. } => permits.limit(),
            Bulkhead::Queue(queue) => queue.max_workers(),
        }
    }

    pub fn metrics(&self) -> BulkheadMetrics {
        match self {
            Bulkhead::Semaphore { permits, .. } => permits.metrics(),
            Bulkhead::Queue(queue) => queue.metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_bulkhead_basic_acquire_release() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(3).unwrap());

        assert_eq!(bulkhead.limit(), 3);
        assert_eq!(bulkhead.acquired(), 0);
        assert_eq!(bulkhead.available(), 3);

        let guard1 = bulkhead.try_acquire();
        assert!(guard1.is_some());
        assert_eq!(bulkhead.acquired(), 1);
        assert_eq!(bulkhead.available(), 2);

        let guard2 = bulkhead.try_acquire();
        assert!(guard2.is_some());
        assert_eq!(bulkhead.acquired(), 2);

        drop(guard1);
        assert_eq!(bulkhead.acquired(), 1);
        assert_eq!(bulkhead.available(), 2);

        drop(guard2);
        assert_eq!(bulkhead.acquired(), 0);
        assert_eq!(bulkhead.available(), 3);
    }

    #[test]
    fn test_bulkhead_at_capacity() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(2).unwrap());

        let guard1 = bulkhead.try_acquire().expect("Should acquire");
        let guard2 = bulkhead.try_acquire().expect("Should acquire");

        // At capacity - should fail
        let guard3 = bulkhead.try_acquire();
        assert!(guard3.is_none(), "Should not acquire when at capacity");
        assert_eq!(bulkhead.acquired(), 2);
        assert_eq!(bulkhead.metrics().rejected, 1);

        drop(guard1);

        let guard4 = bulkhead.try_acquire();
        assert!(guard4.is_some(), "Should acquire after release");
        assert_eq!(bulkhead.acquired(), 2);

        drop(guard2);
        drop(guard4);
    }

    #[test]
    fn test_bulkhead_concurrent_access_never_exceeds_limit() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(5).unwrap());
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];

        for _ in 0..10 {
            let bulkhead_clone = Arc::clone(&bulkhead);
            let peak = Arc::clone(&peak);
            handles.push(thread::spawn(move || {
                if let Some(_guard) = bulkhead_clone.try_acquire() {
                    peak.fetch_max(bulkhead_clone.acquired(), Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    true
                } else {
                    false
                }
            }));
        }

        let acquired_count = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|acquired| *acquired)
            .count();

        assert!(acquired_count >= 5, "At least 5 threads should acquire permits");
        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(bulkhead.acquired(), 0);
        assert_eq!(bulkhead.metrics().rejected as usize, 10 - acquired_count);
    }

    #[test]
    fn test_bulkhead_zero_limit() {
        assert_eq!(
            SemaphoreBulkhead::new(0).unwrap_err(),
            ConfigError::Zero("max_concurrent_calls")
        );
    }

    #[test]
    fn test_bulkhead_guard_releases_on_panic() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(2).unwrap());

        let bulkhead_clone = Arc::clone(&bulkhead);
        let result = std::panic::catch_unwind(move || {
            let _guard = bulkhead_clone.try_acquire().unwrap();
            panic!("Simulated panic");
        });

        assert!(result.is_err());
        assert_eq!(bulkhead.acquired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_release() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(1).unwrap());
        let held = bulkhead.try_acquire().unwrap();

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.acquire(Duration::from_secs(1)).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bulkhead.metrics().queue_depth, 1);
        drop(held);

        assert!(waiter.await.unwrap());
        assert_eq!(bulkhead.acquired(), 0);
        assert_eq!(bulkhead.metrics().queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_gives_up_after_max_wait() {
        let bulkhead = Arc::new(SemaphoreBulkhead::new(1).unwrap());
        let _held = bulkhead.try_acquire().unwrap();

        let start = tokio::time::Instant::now();
        assert!(bulkhead.acquire(Duration::from_millis(250)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(bulkhead.metrics().rejected, 1);
    }

    #[tokio::test]
    async fn test_queue_runs_tasks() {
        let queue = QueueBulkhead::new(2, 4).unwrap();

        let handle = queue.submit(|| async { 21 * 2 }).unwrap();
        assert_eq!(handle.join().await, Ok(42));
        assert_eq!(queue.metrics().max_concurrent, 2);
    }

    #[tokio::test]
    async fn test_queue_rejects_when_full() {
        let queue = QueueBulkhead::new(1, 1).unwrap();
        let gate = Arc::new(Notify::new());

        let blocker = {
            let gate = Arc::clone(&gate);
            queue.submit(move || async move { gate.notified().await }).unwrap()
        };
        while queue.metrics().in_flight == 0 {
            tokio::task::yield_now().await;
        }

        let queued = queue.submit(|| async { "queued" }).unwrap();
        assert_eq!(queue.metrics().queue_depth, 1);
        assert_eq!(queue.submit(|| async { "rejected" }).unwrap_err(), QueueError::Full);
        assert_eq!(queue.metrics().rejected, 1);

        gate.notify_one();
        blocker.join().await.unwrap();
        assert_eq!(queued.join().await, Ok("queued"));
    }

    async fn explode() -> u8 {
        panic!("task exploded")
    }

    #[tokio::test]
    async fn test_queue_resumes_panic_on_caller() {
        let queue = QueueBulkhead::new(1, 1).unwrap();
        let handle = queue.submit(explode).unwrap();

        let joined = tokio::spawn(handle.join()).await;
        assert!(joined.unwrap_err().is_panic());

        // The worker survived the panic
        let handle = queue.submit(|| async { 7 }).unwrap();
        assert_eq!(handle.join().await, Ok(7));
    }

    #[test]
    fn test_queue_requires_runtime() {
        assert_eq!(QueueBulkhead::new(1, 1).unwrap_err(), ConfigError::NoRuntime);
    }
}

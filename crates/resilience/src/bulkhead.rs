//! Bulkhead pattern for limiting concurrent operations
//!
//! The bulkhead bounds how many operations run against a shared resource at
//! once. Callers beyond `max_concurrent` wait in a strict FIFO queue (tokio's
//! semaphore is fair) for at most `max_wait`; a waiter that times out is
//! removed from the queue and never runs its operation. Once admitted, an
//! operation may additionally be bounded by `execution_timeout`.
//!
//! Slots are held by RAII permits, so a slot is released whether the
//! operation succeeds, fails, times out or its future is dropped.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Configuration for bulkhead behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadConfig {
    /// Maximum number of concurrent operations allowed
    pub max_concurrent: usize,
    /// Maximum time a caller waits in the queue for a slot
    pub max_wait: Duration,
    /// Optional deadline for the operation once admitted
    pub execution_timeout: Option<Duration>,
    /// Optional bound on the number of queued callers
    pub max_queue: Option<usize>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_wait: Duration::from_secs(5),
            execution_timeout: None,
            max_queue: None,
        }
    }
}

impl BulkheadConfig {
    /// One timeout budget for both the queue wait and the admitted call
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self { max_concurrent, max_wait: timeout, execution_timeout: Some(timeout), max_queue: None }
    }

    /// Create a new configuration builder
    pub fn builder() -> BulkheadConfigBuilder {
        BulkheadConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid("max_concurrent", "must be greater than 0"));
        }

        if self.max_concurrent > Semaphore::MAX_PERMITS {
            return Err(ConfigError::invalid(
                "max_concurrent",
                format!("must not exceed {}", Semaphore::MAX_PERMITS),
            ));
        }

        if self.execution_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("execution_timeout", "must be greater than zero"));
        }

        Ok(())
    }
}

/// Builder for BulkheadConfig
#[derive(Debug)]
pub struct BulkheadConfigBuilder {
    config: BulkheadConfig,
}

impl Default for BulkheadConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BulkheadConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self { config: BulkheadConfig::default() }
    }

    /// Operations allowed to run at once
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    /// Longest a caller queues for a slot
    pub fn max_wait(mut self, wait: Duration) -> Self {
        self.config.max_wait = wait;
        self
    }

    /// Deadline for each admitted operation
    pub fn execution_timeout(mut self, timeout: Duration) -> Self {
        self.config.execution_timeout = Some(timeout);
        self
    }

    /// Let admitted operations run without a deadline
    pub fn no_execution_timeout(mut self) -> Self {
        self.config.execution_timeout = None;
        self
    }

    /// Reject callers once this many are already waiting
    pub fn max_queue(mut self, max: usize) -> Self {
        self.config.max_queue = Some(max);
        self
    }

    /// Allow any number of waiting callers
    pub fn unbounded_queue(mut self) -> Self {
        self.config.max_queue = None;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<BulkheadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Metrics for bulkhead monitoring
#[derive(Debug, Clone)]
pub struct BulkheadMetrics {
    /// Total number of operations admitted
    pub total_operations: u64,
    /// Total number of operations rejected (queue full or wait timeout)
    pub rejected_operations: u64,
    /// Total number of queue waits that timed out
    pub timeout_count: u64,
    /// Current number of concurrent operations
    pub current_concurrent: usize,
    /// Current number of operations waiting in queue
    pub current_queued: usize,
    /// Maximum concurrent operations allowed
    pub max_concurrent: usize,
}

impl BulkheadMetrics {
    /// Calculate the current utilization as a percentage (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_concurrent as f64 / self.max_concurrent as f64
    }

    /// Calculate the rejection rate as a percentage (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_operations + self.rejected_operations;
        if total == 0 {
            return 0.0;
        }
        self.rejected_operations as f64 / total as f64
    }

    /// Check if the bulkhead is at capacity
    pub fn is_at_capacity(&self) -> bool {
        self.current_concurrent >= self.max_concurrent
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Bulkhead: {}/{} concurrent ({:.1}% utilized), {} queued, {} rejected, {} timeouts",
            self.current_concurrent,
            self.max_concurrent,
            self.utilization() * 100.0,
            self.current_queued,
            self.rejected_operations,
            self.timeout_count
        )
    }
}

struct QueueSlot<'a> {
    queued: &'a AtomicUsize,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bulkhead for limiting concurrent operations
///
/// Clones share the same slots, queue and counters.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use bulwark_resilience::{Bulkhead, BulkheadConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = BulkheadConfig::builder()
///     .max_concurrent(5)
///     .max_wait(Duration::from_millis(250))
///     .build()?;
/// let bulkhead = Bulkhead::new(config)?;
///
/// let value = bulkhead.execute(|| async { Ok::<_, std::io::Error>("done") }).await?;
/// assert_eq!(value, "done");
/// # Ok(())
/// # }
/// ```
pub struct Bulkhead {
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
    total_operations: Arc<AtomicU64>,
    rejected_operations: Arc<AtomicU64>,
    timeout_count: Arc<AtomicU64>,
}

impl Bulkhead {
    /// Create a new bulkhead with the given configuration
    pub fn new(config: BulkheadConfig) -> ConfigResult<Self> {
        config.validate()?;

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent)),
            queued: Arc::new(AtomicUsize::new(0)),
            total_operations: Arc::new(AtomicU64::new(0)),
            rejected_operations: Arc::new(AtomicU64::new(0)),
            timeout_count: Arc::new(AtomicU64::new(0)),
            config,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }

    /// Wait for a slot, bounded by the queue limit and `max_wait`
    async fn acquire<E>(&self) -> Result<SemaphorePermit<'_>, ResilienceError<E>> {
        // Permits released while others wait go straight to the queue head,
        // so this never overtakes a queued caller.
        if let Ok(permit) = self.semaphore.try_acquire() {
            return Ok(permit);
        }

        let _slot = self.enter_queue()?;
        debug!("Bulkhead full, queued behind {} waiters", self.queued().saturating_sub(1));

        match tokio::time::timeout(self.config.max_wait, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(self.full_error()),
            Err(_elapsed) => {
                self.timeout_count.fetch_add(1, Ordering::Relaxed);
                Err(ResilienceError::BulkheadTimeout { waited: self.config.max_wait })
            }
        }
    }

    fn enter_queue<E>(&self) -> Result<QueueSlot<'_>, ResilienceError<E>> {
        let max_queue = self.config.max_queue;
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| match max_queue {
                Some(max) if queued >= max => None,
                _ => Some(queued + 1),
            })
            .map(|_| QueueSlot { queued: &self.queued })
            .map_err(|queued| ResilienceError::BulkheadFull { capacity: self.config.max_concurrent, queued })
    }

    fn full_error<E>(&self) -> ResilienceError<E> {
        ResilienceError::BulkheadFull { capacity: self.config.max_concurrent, queued: self.queued() }
    }

    /// Execute an operation with bulkhead protection
    ///
    /// Waits (FIFO) for a slot up to `max_wait`, runs the operation under
    /// the optional execution timeout, and releases the slot when done.
    #[instrument(skip(self, operation), fields(concurrent = self.current_concurrent()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match self.acquire().await {
            Ok(permit) => permit,
            Err(error) => {
                self.rejected_operations.fetch_add(1, Ordering::Relaxed);
                warn!("Bulkhead rejected operation: {}", error);
                return Err(error);
            }
        };

        self.run_admitted(permit, operation).await
    }

    /// Execute only if a slot is free right now
    ///
    /// Never queues; returns [`ResilienceError::BulkheadFull`] when every
    /// slot is taken.
    pub async fn try_execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Ok(permit) = self.semaphore.try_acquire() else {
            self.rejected_operations.fetch_add(1, Ordering::Relaxed);
            debug!("Bulkhead at capacity, try_execute rejected");
            return Err(self.full_error());
        };

        self.run_admitted(permit, operation).await
    }

    async fn run_admitted<F, Fut, T, E>(
        &self,
        _permit: SemaphorePermit<'_>,
        operation: F,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
        debug!("Bulkhead: executing operation ({} concurrent)", self.current_concurrent());

        let result = match self.config.execution_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result.map_err(ResilienceError::Operation),
                Err(_elapsed) => {
                    warn!("Bulkhead: operation exceeded {:?}", timeout);
                    Err(ResilienceError::Timeout { timeout })
                }
            },
            None => operation().await.map_err(ResilienceError::Operation),
        };

        if result.is_err() {
            debug!("Bulkhead: operation failed, releasing slot");
        }
        result
    }

    /// Number of free slots
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the current number of concurrent operations
    pub fn current_concurrent(&self) -> usize {
        self.config.max_concurrent.saturating_sub(self.semaphore.available_permits())
    }

    /// Get the current number of operations waiting in queue
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Get bulkhead metrics
    pub fn metrics(&self) -> BulkheadMetrics {
        BulkheadMetrics {
            total_operations: self.total_operations.load(Ordering::Acquire),
            rejected_operations: self.rejected_operations.load(Ordering::Acquire),
            timeout_count: self.timeout_count.load(Ordering::Acquire),
            current_concurrent: self.current_concurrent(),
            current_queued: self.queued(),
            max_concurrent: self.config.max_concurrent,
        }
    }

    /// Reset metrics counters
    pub fn reset_metrics(&self) {
        self.total_operations.store(0, Ordering::Release);
        self.rejected_operations.store(0, Ordering::Release);
        self.timeout_count.store(0, Ordering::Release);
    }
}

impl Clone for Bulkhead {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            semaphore: Arc::clone(&self.semaphore),
            queued: Arc::clone(&self.queued),
            total_operations: Arc::clone(&self.total_operations),
            rejected_operations: Arc::clone(&self.rejected_operations),
            timeout_count: Arc::clone(&self.timeout_count),
        }
    }
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("max_concurrent", &self.config.max_concurrent)
            .field("max_queue", &self.config.max_queue)
            .field("current_concurrent", &self.current_concurrent())
            .field("queued", &self.queued())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;

    fn bulkhead(max_concurrent: usize, max_wait: Duration) -> Arc<Bulkhead> {
        let config = BulkheadConfig::builder()
            .max_concurrent(max_concurrent)
            .max_wait(max_wait)
            .build()
            .expect("valid config");
        Arc::new(Bulkhead::new(config).expect("valid bulkhead"))
    }

    /// Occupies one slot until `release` is notified.
    fn hold_slot(bulkhead: &Arc<Bulkhead>, release: &Arc<Notify>) -> tokio::task::JoinHandle<()> {
        let bulkhead = Arc::clone(bulkhead);
        let release = Arc::clone(release);
        tokio::spawn(async move {
            let _ = bulkhead
                .execute(|| async move {
                    release.notified().await;
                    Ok::<_, std::io::Error>(())
                })
                .await;
        })
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        while !condition() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_bulkhead_basic() {
        let bulkhead = bulkhead(2, Duration::from_secs(1));

        let result = bulkhead.execute(|| async { Ok::<_, std::io::Error>(42) }).await;
        assert_eq!(result.expect("should succeed"), 42);
        assert_eq!(bulkhead.available_slots(), 2);
    }

    #[tokio::test]
    async fn test_operation_error_releases_slot() {
        let bulkhead = bulkhead(1, Duration::from_secs(1));

        let result =
            bulkhead.execute(|| async { Err::<(), _>(std::io::Error::other("boom")) }).await;
        assert!(matches!(result, Err(ResilienceError::Operation(_))));
        assert_eq!(bulkhead.available_slots(), 1);
    }

    /// With one slot taken, the next caller is queued rather than rejected and
    /// runs as soon as the slot frees.
    #[tokio::test(start_paused = true)]
    async fn test_extra_caller_is_queued_not_rejected() {
        let bulkhead = bulkhead(1, Duration::from_secs(1));
        let release = Arc::new(Notify::new());
        let holder = hold_slot(&bulkhead, &release);
        wait_until(|| bulkhead.available_slots() == 0).await;

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.execute(|| async { Ok::<_, std::io::Error>(7) }).await })
        };
        wait_until(|| bulkhead.queued() == 1).await;

        release.notify_one();
        holder.await.expect("holder task");
        let result = waiter.await.expect("waiter task");

        assert_eq!(result.expect("queued caller should run"), 7);
        assert_eq!(bulkhead.queued(), 0);
        assert_eq!(bulkhead.metrics().rejected_operations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_never_executes() {
        let bulkhead = bulkhead(1, Duration::from_millis(50));
        let release = Arc::new(Notify::new());
        let holder = hold_slot(&bulkhead, &release);
        wait_until(|| bulkhead.available_slots() == 0).await;

        let executed = AtomicU32::new(0);
        let result = bulkhead
            .execute(|| async {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(())
            })
            .await;

        match result {
            Err(ResilienceError::BulkheadTimeout { waited }) => {
                assert_eq!(waited, Duration::from_millis(50));
            }
            other => panic!("expected BulkheadTimeout, got {other:?}"),
        }
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(bulkhead.queued(), 0, "timed-out waiter leaves the queue");

        let metrics = bulkhead.metrics();
        assert_eq!(metrics.timeout_count, 1);
        assert_eq!(metrics.rejected_operations, 1);

        release.notify_one();
        holder.await.expect("holder task");
    }

    #[tokio::test]
    async fn test_waiters_admitted_in_fifo_order() {
        let bulkhead = bulkhead(1, Duration::from_secs(10));
        let release = Arc::new(Notify::new());
        let holder = hold_slot(&bulkhead, &release);
        wait_until(|| bulkhead.available_slots() == 0).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for id in 1..=3 {
            let bulkhead_ref = Arc::clone(&bulkhead);
            let order = Arc::clone(&order);
            waiters.push(tokio::spawn(async move {
                bulkhead_ref
                    .execute(|| async move {
                        order.lock().push(id);
                        Ok::<_, std::io::Error>(())
                    })
                    .await
            }));
            wait_until(|| bulkhead.queued() == id).await;
        }

        release.notify_one();
        holder.await.expect("holder task");
        for waiter in waiters {
            assert!(waiter.await.expect("waiter task").is_ok());
        }

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_bounded_queue_rejects_when_full() {
        let config = BulkheadConfig::builder()
            .max_concurrent(1)
            .max_queue(1)
            .max_wait(Duration::from_secs(10))
            .build()
            .expect("valid config");
        let bulkhead = Arc::new(Bulkhead::new(config).expect("valid bulkhead"));
        let release = Arc::new(Notify::new());
        let holder = hold_slot(&bulkhead, &release);
        wait_until(|| bulkhead.available_slots() == 0).await;

        let queued = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.execute(|| async { Ok::<_, std::io::Error>(()) }).await })
        };
        wait_until(|| bulkhead.queued() == 1).await;

        let rejected = bulkhead.execute(|| async { Ok::<_, std::io::Error>(()) }).await;
        assert!(matches!(rejected, Err(ResilienceError::BulkheadFull { capacity: 1, queued: 1 })));

        release.notify_one();
        holder.await.expect("holder task");
        assert!(queued.await.expect("queued task").is_ok());
    }

    #[tokio::test]
    async fn test_try_execute_does_not_wait() {
        let bulkhead = bulkhead(1, Duration::from_secs(10));
        let release = Arc::new(Notify::new());
        let holder = hold_slot(&bulkhead, &release);
        wait_until(|| bulkhead.available_slots() == 0).await;

        let result = bulkhead.try_execute(|| async { Ok::<_, std::io::Error>(()) }).await;
        assert!(matches!(result, Err(ResilienceError::BulkheadFull { .. })));
        assert_eq!(bulkhead.queued(), 0);

        release.notify_one();
        holder.await.expect("holder task");

        let result = bulkhead.try_execute(|| async { Ok::<_, std::io::Error>(1) }).await;
        assert_eq!(result.expect("slot is free"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execution_timeout_releases_slot() {
        let bulkhead = Bulkhead::new(BulkheadConfig::new(1, Duration::from_millis(100)))
            .expect("valid bulkhead");

        let result = bulkhead
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, std::io::Error>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
        assert_eq!(bulkhead.available_slots(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let bulkhead = bulkhead(1, Duration::from_secs(10));
        let release = Arc::new(Notify::new());
        let holder = hold_slot(&bulkhead, &release);
        wait_until(|| bulkhead.available_slots() == 0).await;

        let waiter = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.execute(|| async { Ok::<_, std::io::Error>(()) }).await })
        };
        wait_until(|| bulkhead.queued() == 1).await;

        waiter.abort();
        assert!(waiter.await.is_err());
        assert_eq!(bulkhead.queued(), 0);

        release.notify_one();
        holder.await.expect("holder task");
        assert_eq!(bulkhead.available_slots(), 1);
    }

    #[test]
    fn test_bulkhead_config_validation() {
        assert!(BulkheadConfig::builder().max_concurrent(0).build().is_err());
        assert!(BulkheadConfig::builder().execution_timeout(Duration::ZERO).build().is_err());
        assert!(BulkheadConfig::builder().max_concurrent(1).build().is_ok());
        assert!(Bulkhead::new(BulkheadConfig { max_concurrent: 0, ..BulkheadConfig::default() }).is_err());
    }

    #[test]
    fn test_single_budget_constructor() {
        let config = BulkheadConfig::new(4, Duration::from_secs(2));
        assert_eq!(config.max_wait, Duration::from_secs(2));
        assert_eq!(config.execution_timeout, Some(Duration::from_secs(2)));
        assert!(config.max_queue.is_none());
    }

    #[test]
    fn test_bulkhead_metrics_methods() {
        let metrics = BulkheadMetrics {
            total_operations: 80,
            rejected_operations: 20,
            timeout_count: 5,
            current_concurrent: 5,
            current_queued: 2,
            max_concurrent: 10,
        };

        assert_eq!(metrics.utilization(), 0.5);
        assert_eq!(metrics.rejection_rate(), 0.2);
        assert!(!metrics.is_at_capacity());
        assert!(metrics.status_message().contains("5/10 concurrent"));
    }
}

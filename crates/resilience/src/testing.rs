//! Test helpers for code built on the resilience layers
//!
//! - **[`ScriptedOperation`]**: an operation that replays a fixed sequence of
//!   outcomes and counts its invocations
//! - **[`poll_until`]**: wait for an async condition with a deadline
//! - **[`assert_duration_in_range`]**: tolerant duration assertion
//!
//! [`MockClock`](crate::clock::MockClock) lives in [`crate::clock`].

#![allow(clippy::missing_panics_doc)]

use std::future::{self, Future, Ready};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Operation that returns pre-scripted outcomes in order
///
/// Once the script runs out, the last outcome repeats. Clones share the
/// script and the call counter, so a clone can be moved into an executor
/// while the test keeps inspecting the original.
///
/// # Examples
///
/// ```rust
/// # #[cfg(feature = "test-utils")]
/// # async fn example() {
/// use bulwark_resilience::testing::ScriptedOperation;
///
/// let op = ScriptedOperation::new([Err("busy"), Ok(7)]);
///
/// assert_eq!(op.call().await, Err("busy"));
/// assert_eq!(op.call().await, Ok(7));
/// assert_eq!(op.call().await, Ok(7));
/// assert_eq!(op.calls(), 3);
/// # }
/// ```
#[derive(Debug)]
pub struct ScriptedOperation<T, E> {
    outcomes: Arc<[Result<T, E>]>,
    calls: Arc<AtomicU32>,
}

impl<T, E> Clone for ScriptedOperation<T, E> {
    fn clone(&self) -> Self {
        Self { outcomes: Arc::clone(&self.outcomes), calls: Arc::clone(&self.calls) }
    }
}

impl<T: Clone, E: Clone> ScriptedOperation<T, E> {
    /// Script the outcomes of successive calls; must not be empty
    pub fn new(outcomes: impl IntoIterator<Item = Result<T, E>>) -> Self {
        let outcomes: Arc<[Result<T, E>]> = outcomes.into_iter().collect();
        assert!(!outcomes.is_empty(), "ScriptedOperation needs at least one outcome");
        Self { outcomes, calls: Arc::new(AtomicU32::new(0)) }
    }

    /// Fail `failures` times with `error`, then succeed with `value`
    pub fn failing_then(failures: usize, error: E, value: T) -> Self {
        Self::new(std::iter::repeat(Err(error)).take(failures).chain(std::iter::once(Ok(value))))
    }

    /// Fail on every call
    pub fn always_failing(error: E) -> Self {
        Self::new([Err(error)])
    }

    /// Next scripted outcome as a ready future
    pub fn call(&self) -> Ready<Result<T, E>> {
        future::ready(self.next_outcome())
    }

    /// Next scripted outcome, for synchronous callers
    pub fn next_outcome(&self) -> Result<T, E> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        self.outcomes[call.min(self.outcomes.len() - 1)].clone()
    }

    /// Number of times the operation has been invoked
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Poll `condition` every `interval` until it holds or `timeout` elapses
///
/// Uses tokio time, so it cooperates with paused test clocks.
pub async fn poll_until<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }

    condition().await
}

/// Assert that `actual` is within `tolerance` of `expected`
pub fn assert_duration_in_range(actual: Duration, expected: Duration, tolerance: Duration) {
    let min = expected.saturating_sub(tolerance);
    let max = expected.saturating_add(tolerance);

    assert!(actual >= min && actual <= max, "Duration {actual:?} not in range [{min:?}, {max:?}]");
}

//! Ordered fallbacks tried after a primary operation fails
//!
//! Fallbacks run strictly in registration order and the first success wins.
//! A fallback that panics is skipped rather than aborting the chain. When
//! every fallback fails, the chain returns the error of the last fallback
//! that actually produced an outcome, not the primary's original error.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::error::panic_message;

type FallbackFn<T, E> = Box<dyn Fn(&E) -> BoxFuture<'static, Result<T, E>> + Send + Sync>;

/// Ordered list of alternatives for a failing operation
///
/// # Examples
///
/// ```rust
/// use bulwark_resilience::FallbackChain;
///
/// # async fn example() {
/// let chain = FallbackChain::new()
///     .then(|| async { Err::<&str, String>("replica down".to_string()) })
///     .then_value("cached");
///
/// let value = chain.execute(|| async { Err("primary down".to_string()) }).await;
/// assert_eq!(value, Ok("cached"));
/// # }
/// ```
pub struct FallbackChain<T, E> {
    fallbacks: Vec<FallbackFn<T, E>>,
}

impl<T, E> Default for FallbackChain<T, E> {
    fn default() -> Self {
        Self { fallbacks: Vec::new() }
    }
}

impl<T, E> fmt::Debug for FallbackChain<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackChain").field("fallbacks", &self.fallbacks.len()).finish()
    }
}

impl<T, E> FallbackChain<T, E> {
    /// Number of registered fallbacks
    pub fn len(&self) -> usize {
        self.fallbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fallbacks.is_empty()
    }
}

impl<T, E> FallbackChain<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an alternative operation
    #[must_use]
    pub fn then<F, Fut>(self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.then_with(move |_previous: &E| fallback())
    }

    /// Append an alternative that sees the error it is replacing
    #[must_use]
    pub fn then_with<F, Fut>(mut self, fallback: F) -> Self
    where
        F: Fn(&E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.fallbacks.push(Box::new(move |previous: &E| fallback(previous).boxed()));
        self
    }

    /// Append a constant that always succeeds
    #[must_use]
    pub fn then_value(self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.then(move || {
            let value = value.clone();
            async move { Ok(value) }
        })
    }

    /// Run `primary`, then each fallback in order until one succeeds
    pub async fn execute<F, Fut>(&self, primary: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut last_error = match primary().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if self.fallbacks.is_empty() {
            debug!("Primary failed with no fallbacks configured");
            return Err(last_error);
        }

        for (index, fallback) in self.fallbacks.iter().enumerate() {
            let previous = &last_error;
            let attempt = AssertUnwindSafe(async move { fallback(previous).await }).catch_unwind().await;

            match attempt {
                Ok(Ok(value)) => {
                    info!("Fallback {} of {} succeeded", index + 1, self.fallbacks.len());
                    return Ok(value);
                }
                Ok(Err(error)) => {
                    warn!("Fallback {} of {} failed", index + 1, self.fallbacks.len());
                    last_error = error;
                }
                Err(payload) => {
                    warn!(
                        "Fallback {} of {} panicked, skipping: {}",
                        index + 1,
                        self.fallbacks.len(),
                        panic_message(payload.as_ref())
                    );
                }
            }
        }

        Err(last_error)
    }
}

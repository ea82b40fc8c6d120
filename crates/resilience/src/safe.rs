//! Retry loop for arbitrary fallible code
//!
//! [`SafeExecutor`] is the boundary where code that returns any error type,
//! or panics, is captured into a typed outcome. Each attempt is optionally
//! bounded by a timeout; failures are logged, retried per the configured
//! [`RetryPolicy`], and the final failure is mapped to the caller's error
//! type `E`.
//!
//! The target type is fixed when the executor is built: [`SafeExecutorBuilder::build`]
//! requires `E: From<SafeError>`, anything else needs an explicit mapper via
//! [`SafeExecutorBuilder::build_with_mapper`].

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, instrument, warn};

use crate::error::{panic_message, BoxedError, ConfigError, ConfigResult, SafeError};
use crate::retry::RetryPolicy;

type RetryPredicate = Arc<dyn Fn(&SafeError) -> bool + Send + Sync>;
type Logger = Arc<dyn Fn(&SafeError, u32) + Send + Sync>;
type RetryHook = Arc<dyn Fn(&SafeError, u32, Duration) + Send + Sync>;
type ErrorMapper<E> = Arc<dyn Fn(SafeError) -> E + Send + Sync>;

/// Builder for [`SafeExecutor`]
#[derive(Default)]
pub struct SafeExecutorBuilder {
    policy: RetryPolicy,
    timeout: Option<Duration>,
    retry_if: Option<RetryPredicate>,
    logger: Option<Logger>,
    on_retry: Option<RetryHook>,
}

impl fmt::Debug for SafeExecutorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeExecutorBuilder")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SafeExecutorBuilder {
    /// Start with the default retry policy and no timeout
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy deciding how often and how long to retry
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Deadline for each async attempt
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Only retry failures for which `predicate` returns true
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&SafeError) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Some(Arc::new(predicate));
        self
    }

    /// Called with every failure and its 1-based attempt number
    pub fn logger<L>(mut self, logger: L) -> Self
    where
        L: Fn(&SafeError, u32) + Send + Sync + 'static,
    {
        self.logger = Some(Arc::new(logger));
        self
    }

    /// Called before sleeping ahead of a retry
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(&SafeError, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Build an executor whose error type converts from [`SafeError`]
    pub fn build<E>(self) -> ConfigResult<SafeExecutor<E>>
    where
        E: From<SafeError> + 'static,
    {
        self.build_with_mapper(E::from)
    }

    /// Build an executor that maps final failures with `mapper`
    pub fn build_with_mapper<E, M>(self, mapper: M) -> ConfigResult<SafeExecutor<E>>
    where
        M: Fn(SafeError) -> E + Send + Sync + 'static,
    {
        self.policy.validate()?;
        if self.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }

        Ok(SafeExecutor {
            policy: self.policy,
            timeout: self.timeout,
            retry_if: self.retry_if,
            logger: self.logger,
            on_retry: self.on_retry,
            mapper: Arc::new(mapper),
        })
    }
}

/// Timeout, retry and logging around code that may fail or panic
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use bulwark_resilience::{RetryPolicy, SafeError, SafeExecutor};
///
/// # async fn example() -> Result<(), bulwark_resilience::ConfigError> {
/// let executor = SafeExecutor::builder()
///     .retry_policy(RetryPolicy::exponential(3, Duration::from_millis(50), 2.0))
///     .timeout(Duration::from_secs(2))
///     .build_with_mapper(|error: SafeError| error.to_string())?;
///
/// let body: Result<String, String> = executor
///     .execute(|| async { Ok::<_, std::io::Error>("pong".to_string()) })
///     .await;
/// assert_eq!(body.as_deref(), Ok("pong"));
/// # Ok(())
/// # }
/// ```
pub struct SafeExecutor<E> {
    policy: RetryPolicy,
    timeout: Option<Duration>,
    retry_if: Option<RetryPredicate>,
    logger: Option<Logger>,
    on_retry: Option<RetryHook>,
    mapper: ErrorMapper<E>,
}

impl<E> Clone for SafeExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            timeout: self.timeout,
            retry_if: self.retry_if.clone(),
            logger: self.logger.clone(),
            on_retry: self.on_retry.clone(),
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<E> fmt::Debug for SafeExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SafeExecutor")
            .field("policy", &self.policy)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SafeExecutor<SafeError> {
    /// Create a builder
    pub fn builder() -> SafeExecutorBuilder {
        SafeExecutorBuilder::new()
    }
}

impl<E> SafeExecutor<E> {
    /// Retry policy driving the loop
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Per-attempt timeout for async execution
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run an async operation with timeout, retry and panic capture
    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts()))]
    pub async fn execute<F, Fut, T, X>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, X>>,
        X: Into<BoxedError>,
    {
        let mut attempt = 1;
        loop {
            let error = match self.attempt_async(&mut operation).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Operation succeeded on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let delay = self.next_delay(error, attempt)?;
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run a blocking operation with retry and panic capture
    ///
    /// The per-attempt timeout is not applied here; a blocking call cannot
    /// be interrupted. Retry delays block the current thread.
    #[instrument(skip_all, fields(max_attempts = self.policy.max_attempts()))]
    pub fn call<F, T, X>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Result<T, X>,
        X: Into<BoxedError>,
    {
        let mut attempt = 1;
        loop {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(&mut operation));
            let error = match capture(outcome) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let delay = self.next_delay(error, attempt)?;
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    async fn attempt_async<F, Fut, T, X>(&self, operation: &mut F) -> Result<T, SafeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, X>>,
        X: Into<BoxedError>,
    {
        let guarded = AssertUnwindSafe(async { operation().await }).catch_unwind();

        let outcome = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, guarded)
                .await
                .map_err(|_elapsed| SafeError::Timeout { timeout })?,
            None => guarded.await,
        };

        capture(outcome)
    }

    /// Decide what follows a failed attempt: a delay, or the final error
    fn next_delay(&self, error: SafeError, attempt: u32) -> Result<Duration, E> {
        if let Some(logger) = &self.logger {
            logger(&error, attempt);
        }

        let retryable = self.retry_if.as_ref().map_or(true, |predicate| predicate(&error));
        if !retryable {
            warn!(kind = error.kind(), attempt, "Non-retryable error: {}", error);
            return Err((self.mapper)(error));
        }

        if !self.policy.should_retry(attempt) {
            warn!(kind = error.kind(), attempt, "Retries exhausted: {}", error);
            return Err((self.mapper)(error));
        }

        let delay = self.policy.delay(attempt);
        if let Some(on_retry) = &self.on_retry {
            on_retry(&error, attempt, delay);
        }
        debug!(kind = error.kind(), attempt, "Attempt failed, retrying in {:?}: {}", delay, error);
        Ok(delay)
    }
}

fn capture<T, X: Into<BoxedError>>(
    outcome: Result<Result<T, X>, Box<dyn std::any::Any + Send>>,
) -> Result<T, SafeError> {
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(SafeError::Failed(error.into())),
        Err(payload) => Err(SafeError::Panicked { message: panic_message(payload.as_ref()) }),
    }
}

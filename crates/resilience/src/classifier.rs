//! Error classification for recovery decisions
//!
//! Recovery layers never inspect caller errors directly. They ask an
//! [`ErrorClassifier`] for the error's [`Severity`], a base retry delay and a
//! stable kind key used to track how often that kind of error occurs.
//!
//! Error types that know their own characteristics implement [`Classify`] and
//! get [`DefaultClassifier`] for free. Anything else can be classified with a
//! closure through [`FnClassifier`].

use std::fmt;
use std::io;
use std::time::Duration;

use crate::error::ResilienceError;
use crate::retry::RetryPolicy;

/// How an error should influence recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Likely to succeed if attempted again shortly
    Transient,
    /// May succeed after the dependency recovers
    Recoverable,
    /// Retrying cannot help
    Permanent,
    /// System integrity is at risk; never retried
    Critical,
}

impl Severity {
    /// Transient and recoverable errors are worth retrying
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Recoverable)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "TRANSIENT"),
            Self::Recoverable => write!(f, "RECOVERABLE"),
            Self::Permanent => write!(f, "PERMANENT"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Self-classification implemented by error types
pub trait Classify {
    /// Severity of this error
    fn severity(&self) -> Severity;

    /// Suggested delay before retrying, e.g. from a Retry-After header
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Key grouping errors of the same kind for frequency tracking
    fn kind(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Injectable policy that classifies errors of type `E`
pub trait ErrorClassifier<E>: Send + Sync {
    /// Severity of the error
    fn classify(&self, error: &E) -> Severity;

    /// Base delay before retry `attempt` (1-based) of this error
    fn retry_delay(&self, error: &E, attempt: u32) -> Duration;

    /// Key grouping errors of the same kind; defaults to the type name
    fn error_kind(&self, _error: &E) -> String {
        std::any::type_name::<E>().to_string()
    }

    /// Whether the error is worth retrying at all
    fn is_retryable(&self, error: &E) -> bool {
        self.classify(error).is_retryable()
    }
}

/// Classifier for error types implementing [`Classify`]
///
/// The base delay doubles with each attempt from `base_delay` up to
/// `max_delay`, unless the error itself suggests a delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultClassifier {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for DefaultClassifier {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(30) }
    }
}

impl DefaultClassifier {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }

    /// Doubling backoff for retry `attempt` (1-based), capped at `max_delay`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1_u32 << doublings).min(self.max_delay)
    }
}

impl<E: Classify> ErrorClassifier<E> for DefaultClassifier {
    fn classify(&self, error: &E) -> Severity {
        error.severity()
    }

    fn retry_delay(&self, error: &E, attempt: u32) -> Duration {
        error.retry_after().unwrap_or_else(|| self.backoff(attempt))
    }

    fn error_kind(&self, error: &E) -> String {
        error.kind()
    }
}

/// Classifier built from a closure, with delays taken from a [`RetryPolicy`]
pub struct FnClassifier<F> {
    classify: F,
    policy: RetryPolicy,
}

impl<F> FnClassifier<F> {
    pub fn new(classify: F) -> Self {
        Self { classify, policy: RetryPolicy::default() }
    }

    /// Use `policy` to derive the base retry delay
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl<F> fmt::Debug for FnClassifier<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnClassifier").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl<E, F> ErrorClassifier<E> for FnClassifier<F>
where
    F: Fn(&E) -> Severity + Send + Sync,
{
    fn classify(&self, error: &E) -> Severity {
        (self.classify)(error)
    }

    fn retry_delay(&self, _error: &E, attempt: u32) -> Duration {
        self.policy.delay(attempt)
    }
}

impl<K: ErrorClassifier<E> + ?Sized, E> ErrorClassifier<E> for std::sync::Arc<K> {
    fn classify(&self, error: &E) -> Severity {
        (**self).classify(error)
    }

    fn retry_delay(&self, error: &E, attempt: u32) -> Duration {
        (**self).retry_delay(error, attempt)
    }

    fn error_kind(&self, error: &E) -> String {
        (**self).error_kind(error)
    }
}

/// Classifier that treats every error as permanent
///
/// Used where no recovery is configured, so nothing is ever retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeverRetry;

impl<E> ErrorClassifier<E> for NeverRetry {
    fn classify(&self, _error: &E) -> Severity {
        Severity::Permanent
    }

    fn retry_delay(&self, _error: &E, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// Lifts a classifier for `E` to the layered [`ResilienceError<E>`]
///
/// A rejection by an open circuit is permanent as far as retrying is
/// concerned: waiting out the cool-down is the breaker's job. Bulkhead
/// rejections and timeouts are transient. Panics are critical.
#[derive(Debug, Clone)]
pub struct LayeredClassifier<K> {
    inner: K,
}

impl<K> LayeredClassifier<K> {
    pub fn new(inner: K) -> Self {
        Self { inner }
    }

    /// The classifier applied to operation errors
    pub fn inner(&self) -> &K {
        &self.inner
    }
}

impl<E, K: ErrorClassifier<E>> ErrorClassifier<ResilienceError<E>> for LayeredClassifier<K> {
    fn classify(&self, error: &ResilienceError<E>) -> Severity {
        match error {
            ResilienceError::CircuitOpen { .. } => Severity::Permanent,
            ResilienceError::BulkheadTimeout { .. }
            | ResilienceError::BulkheadFull { .. }
            | ResilienceError::Timeout { .. } => Severity::Transient,
            ResilienceError::Panicked { .. } => Severity::Critical,
            ResilienceError::Operation(inner) => self.inner.classify(inner),
        }
    }

    fn retry_delay(&self, error: &ResilienceError<E>, attempt: u32) -> Duration {
        match error {
            ResilienceError::Operation(inner) => self.inner.retry_delay(inner, attempt),
            ResilienceError::CircuitOpen { remaining } => *remaining,
            _ => DefaultClassifier::default().backoff(attempt),
        }
    }

    fn error_kind(&self, error: &ResilienceError<E>) -> String {
        match error {
            ResilienceError::CircuitOpen { .. } => "circuit_open".to_string(),
            ResilienceError::BulkheadTimeout { .. } | ResilienceError::BulkheadFull { .. } => {
                "bulkhead_rejected".to_string()
            }
            ResilienceError::Timeout { .. } => "timeout".to_string(),
            ResilienceError::Panicked { .. } => "panicked".to_string(),
            ResilienceError::Operation(inner) => self.inner.error_kind(inner),
        }
    }
}

impl<E: Classify> Classify for ResilienceError<E> {
    fn severity(&self) -> Severity {
        LayeredClassifier::new(DefaultClassifier::default()).classify(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Operation(inner) => inner.retry_after(),
            Self::CircuitOpen { remaining } => Some(*remaining),
            _ => None,
        }
    }

    fn kind(&self) -> String {
        LayeredClassifier::new(DefaultClassifier::default()).error_kind(self)
    }
}

impl Classify for io::Error {
    fn severity(&self) -> Severity {
        match self.kind() {
            io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => Severity::Transient,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::AddrInUse => Severity::Recoverable,
            io::ErrorKind::OutOfMemory => Severity::Critical,
            _ => Severity::Permanent,
        }
    }

    fn kind(&self) -> String {
        format!("io::{:?}", io::Error::kind(self))
    }
}

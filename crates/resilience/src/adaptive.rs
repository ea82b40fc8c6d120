//! Adaptive recovery with error-frequency scaled backoff
//!
//! [`AdaptiveRecovery`] retries an operation while its errors are classified
//! as retryable, and stretches the delay for error kinds it has seen often:
//!
//! ```text
//! delay = classifier.retry_delay(error, attempt) × (1 + count[kind] × frequency_weight)
//! ```
//!
//! The count is the one held before the failing attempt. A failure is only
//! counted when it ends the call: the error is not retryable, the attempts
//! are used up, or the next delay would exceed `max_delay`. Every success
//! decays all counts geometrically by `decay_factor`; entries that fall below
//! a negligible level are dropped.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::classifier::ErrorClassifier;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult};

/// Counts below this are treated as zero and removed
const NEGLIGIBLE_COUNT: f64 = 0.01;

/// Configuration for adaptive recovery
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveConfig {
    /// Maximum attempts including the first call
    pub max_attempts: u32,
    /// Give up instead of waiting when a computed delay exceeds this
    pub max_delay: Option<Duration>,
    /// Multiplier applied to every error count after a success (0.0 to 1.0)
    pub decay_factor: f64,
    /// Extra delay fraction per recorded error of the same kind
    pub frequency_weight: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_delay: Some(Duration::from_secs(30)),
            decay_factor: 0.9,
            frequency_weight: 0.1,
        }
    }
}

impl AdaptiveConfig {
    /// Create a new configuration builder
    pub fn builder() -> AdaptiveConfigBuilder {
        AdaptiveConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be greater than 0"));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor < 1.0) {
            return Err(ConfigError::invalid("decay_factor", "must be between 0.0 and 1.0 (exclusive)"));
        }
        if !self.frequency_weight.is_finite() || self.frequency_weight < 0.0 {
            return Err(ConfigError::invalid("frequency_weight", "must be a finite value >= 0.0"));
        }
        Ok(())
    }
}

/// Builder for AdaptiveConfig
#[derive(Debug)]
pub struct AdaptiveConfigBuilder {
    config: AdaptiveConfig,
}

impl Default for AdaptiveConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AdaptiveConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self { config: AdaptiveConfig::default() }
    }

    /// Maximum attempts including the first call
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Give up once a computed delay exceeds `max_delay`
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.config.max_delay = Some(max_delay);
        self
    }

    /// Never give up because of the delay size
    pub fn no_max_delay(mut self) -> Self {
        self.config.max_delay = None;
        self
    }

    /// Multiplier applied to every count after a success
    pub fn decay_factor(mut self, factor: f64) -> Self {
        self.config.decay_factor = factor;
        self
    }

    /// Extra delay fraction per counted error of the same kind
    pub fn frequency_weight(mut self, weight: f64) -> Self {
        self.config.frequency_weight = weight;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<AdaptiveConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Tracked history for one error kind
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorKindStats {
    /// Decaying count of recent failures
    pub count: f64,
    /// When this kind last failed
    pub last_error: Instant,
    /// Delay computed for the failure that last ended a call
    pub adaptive_delay: Duration,
}

/// Snapshot of adaptive recovery state
#[derive(Debug, Clone, Default)]
pub struct RecoveryStatistics {
    /// Per-kind history keyed by `ErrorClassifier::error_kind`
    pub error_kinds: HashMap<String, ErrorKindStats>,
}

impl RecoveryStatistics {
    /// Decaying failure count for `kind`, zero if untracked
    pub fn count(&self, kind: &str) -> f64 {
        self.error_kinds.get(kind).map_or(0.0, |stats| stats.count)
    }

    /// Sum of all tracked counts
    pub fn total_errors(&self) -> f64 {
        self.error_kinds.values().map(|stats| stats.count).sum()
    }

    /// True when no error kind is tracked
    pub fn is_empty(&self) -> bool {
        self.error_kinds.is_empty()
    }
}

/// Retry loop driven by error classification and observed error frequency
///
/// Clones share the tracked error history.
pub struct AdaptiveRecovery<K, C: Clock = SystemClock> {
    config: AdaptiveConfig,
    classifier: Arc<K>,
    state: Arc<Mutex<HashMap<String, ErrorKindStats>>>,
    clock: Arc<C>,
}

impl<K, C: Clock> Clone for AdaptiveRecovery<K, C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            classifier: Arc::clone(&self.classifier),
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl<K, C: Clock> fmt::Debug for AdaptiveRecovery<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveRecovery")
            .field("config", &self.config)
            .field("tracked_kinds", &self.state.lock().len())
            .finish()
    }
}

impl<K> AdaptiveRecovery<K, SystemClock> {
    /// Create adaptive recovery using the system clock
    pub fn new(config: AdaptiveConfig, classifier: K) -> ConfigResult<Self> {
        Self::with_clock(config, classifier, SystemClock)
    }
}

impl<K, C: Clock> AdaptiveRecovery<K, C> {
    /// Create adaptive recovery with a custom clock (useful for testing)
    pub fn with_clock(config: AdaptiveConfig, classifier: K, clock: C) -> ConfigResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classifier: Arc::new(classifier),
            state: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &AdaptiveConfig {
        &self.config
    }

    /// The classifier consulted on every failure
    pub fn classifier(&self) -> &K {
        &self.classifier
    }

    /// Run the operation with the configured attempt and delay bounds
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        K: ErrorClassifier<E>,
    {
        self.execute_with(operation, self.config.max_attempts, self.config.max_delay).await
    }

    /// Run the operation with per-call attempt and delay bounds
    ///
    /// `max_attempts` of zero is treated as one.
    #[instrument(skip_all, fields(max_attempts = max_attempts))]
    pub async fn execute_with<F, Fut, T, E>(
        &self,
        mut operation: F,
        max_attempts: u32,
        max_delay: Option<Duration>,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        K: ErrorClassifier<E>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let error = match operation().await {
                Ok(value) => {
                    self.decay();
                    if attempt > 1 {
                        info!("Operation recovered on attempt {}", attempt);
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let severity = self.classifier.classify(&error);
            let kind = self.classifier.error_kind(&error);
            let delay = self.adaptive_delay(&kind, self.classifier.retry_delay(&error, attempt));

            if !severity.is_retryable() {
                self.record_failure(&kind, delay);
                warn!(kind = %kind, severity = %severity, "Non-retryable error on attempt {}", attempt);
                return Err(error);
            }

            if attempt >= max_attempts {
                self.record_failure(&kind, delay);
                warn!(kind = %kind, "Giving up after {} attempts", attempt);
                return Err(error);
            }

            if let Some(max_delay) = max_delay {
                if delay > max_delay {
                    self.record_failure(&kind, delay);
                    warn!(kind = %kind, "Adaptive delay {:?} exceeds {:?}, giving up", delay, max_delay);
                    return Err(error);
                }
            }

            debug!(kind = %kind, "Attempt {} failed, retrying in {:?}", attempt, delay);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Scale `base_delay` by how often `kind` has failed so far
    fn adaptive_delay(&self, kind: &str, base_delay: Duration) -> Duration {
        let count = self.state.lock().get(kind).map_or(0.0, |stats| stats.count);
        scale_delay(base_delay, count, self.config.frequency_weight)
    }

    /// Count a failure of `kind` that ended the call
    fn record_failure(&self, kind: &str, delay: Duration) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let stats = state.entry(kind.to_string()).or_insert(ErrorKindStats {
            count: 0.0,
            last_error: now,
            adaptive_delay: Duration::ZERO,
        });

        stats.count += 1.0;
        stats.last_error = now;
        stats.adaptive_delay = delay;
    }

    fn decay(&self) {
        let factor = self.config.decay_factor;
        let mut state = self.state.lock();
        state.retain(|_, stats| {
            stats.count *= factor;
            stats.count >= NEGLIGIBLE_COUNT
        });
    }

    /// Snapshot of the tracked error history
    pub fn statistics(&self) -> RecoveryStatistics {
        RecoveryStatistics { error_kinds: self.state.lock().clone() }
    }

    /// Forget all tracked errors
    pub fn reset(&self) {
        self.state.lock().clear();
        debug!("Adaptive recovery history cleared");
    }
}

fn scale_delay(base: Duration, count: f64, weight: f64) -> Duration {
    let factor = count.mul_add(weight, 1.0);
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

//! Retry delay policy
//!
//! [`RetryPolicy`] is an immutable value object: a pure function from attempt
//! number to delay, plus the attempt bound. It never sleeps and never runs an
//! operation itself, so a single instance can be shared freely between
//! concurrent callers. The loops that consume it live in
//! [`SafeExecutor`](crate::safe::SafeExecutor) and
//! [`AdaptiveRecovery`](crate::adaptive::AdaptiveRecovery).

use std::time::Duration;

use rand::Rng;

use crate::error::{ConfigError, ConfigResult};

/// Lower bound of the multiplicative jitter factor
pub const JITTER_MIN_FACTOR: f64 = 0.5;
/// Upper (exclusive) bound of the multiplicative jitter factor
pub const JITTER_MAX_FACTOR: f64 = 1.5;

/// Backoff strategy for calculating retry delays
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Every retry waits the base delay, unclamped and unjittered
    Fixed,
    /// Delay grows with the attempt number: `base * attempt`
    Linear,
    /// Delay grows geometrically: `base * multiplier^(attempt - 1)`
    Exponential { multiplier: f64 },
}

/// Immutable retry schedule
///
/// Attempt numbers are 1-based: attempt 1 is the first call, and
/// `delay(n)` is the wait after attempt `n` failed.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use bulwark_resilience::RetryPolicy;
///
/// let policy = RetryPolicy::exponential(3, Duration::from_millis(100), 2.0);
///
/// assert_eq!(policy.delay(1), Duration::from_millis(100));
/// assert_eq!(policy.delay(2), Duration::from_millis(200));
/// assert_eq!(policy.delay(3), Duration::from_millis(400));
/// assert!(!policy.should_retry(3));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff: BackoffStrategy,
    max_delay: Option<Duration>,
    jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100), 2.0)
            .with_max_delay(Duration::from_secs(30))
    }
}

impl RetryPolicy {
    /// Create a configuration builder
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// A policy that runs the operation exactly once
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Constant delay between attempts
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            backoff: BackoffStrategy::Fixed,
            max_delay: None,
            jitter: false,
        }
    }

    /// Delay of `base * attempt`
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, backoff: BackoffStrategy::Linear, max_delay: None, jitter: false }
    }

    /// Delay of `base * multiplier^(attempt - 1)`
    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: BackoffStrategy::Exponential { multiplier },
            max_delay: None,
            jitter: false,
        }
    }

    /// Cap every computed delay (ignored by [`BackoffStrategy::Fixed`])
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Enable or disable jitter (ignored by [`BackoffStrategy::Fixed`])
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total number of attempts, including the first call
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Base delay the strategy scales from
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Configured backoff strategy
    pub fn backoff(&self) -> BackoffStrategy {
        self.backoff
    }

    /// Delay ceiling, if any
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// Whether jitter is applied
    pub fn jitter(&self) -> bool {
        self.jitter
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }

        if let BackoffStrategy::Exponential { multiplier } = self.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(ConfigError::invalid(
                    "backoff_multiplier",
                    format!("must be a finite value >= 1.0, got {multiplier}"),
                ));
            }
        }

        Ok(())
    }

    /// Delay to wait after attempt `attempt` (1-based) failed
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_schedule(attempt);
        if self.jitter && self.backoff != BackoffStrategy::Fixed {
            apply_jitter(delay, rand::thread_rng().gen_range(JITTER_MIN_FACTOR..JITTER_MAX_FACTOR))
        } else {
            delay
        }
    }

    /// Delay before jitter: the exact, reproducible schedule
    pub fn base_schedule(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base_nanos = self.base_delay.as_nanos() as f64;

        let nanos = match self.backoff {
            BackoffStrategy::Fixed => return self.base_delay,
            BackoffStrategy::Linear => base_nanos * f64::from(attempt),
            BackoffStrategy::Exponential { multiplier } => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                base_nanos * multiplier.powi(exponent)
            }
        };

        let capped = match self.max_delay {
            Some(max_delay) => nanos.min(max_delay.as_nanos() as f64),
            None => nanos,
        };
        nanos_to_duration(capped)
    }

    /// Whether another attempt is allowed after `current_attempt` attempts
    pub fn should_retry(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }

    /// Attempts left after `current_attempt` attempts have been made
    pub fn retries_remaining(&self, current_attempt: u32) -> u32 {
        self.max_attempts.saturating_sub(current_attempt)
    }

    /// Iterator over the delays between attempts (`max_attempts - 1` items)
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.max_attempts).map(move |attempt| self.delay(attempt))
    }
}

/// Scale `delay` by a jitter factor
pub(crate) fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    nanos_to_duration(delay.as_nanos() as f64 * factor)
}

fn nanos_to_duration(nanos: f64) -> Duration {
    if !nanos.is_finite() || nanos >= u64::MAX as f64 {
        return Duration::from_nanos(u64::MAX);
    }
    if nanos <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(nanos.round() as u64)
}

/// Builder for [`RetryPolicy`]
#[derive(Debug)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    /// Start from the default policy
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    /// Maximum attempts including the first call
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Delay before the first retry
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    /// Wait `base_delay` before every retry
    pub fn fixed_backoff(mut self) -> Self {
        self.policy.backoff = BackoffStrategy::Fixed;
        self
    }

    /// Wait `base_delay × attempt`
    pub fn linear_backoff(mut self) -> Self {
        self.policy.backoff = BackoffStrategy::Linear;
        self
    }

    /// Wait `base_delay × multiplier^(attempt - 1)`
    pub fn exponential_backoff(mut self, multiplier: f64) -> Self {
        self.policy.backoff = BackoffStrategy::Exponential { multiplier };
        self
    }

    /// Cap every computed delay
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.policy.max_delay = Some(max_delay);
        self
    }

    /// Remove the delay cap
    pub fn no_max_delay(mut self) -> Self {
        self.policy.max_delay = None;
        self
    }

    /// Spread delays randomly to avoid synchronized retries
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Validate and return the policy
    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

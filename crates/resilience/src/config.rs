//! Declarative configuration for every resilience layer
//!
//! A [`ResilienceConfig`] is an explicit value handed to constructors; there
//! is no process-wide default. Each section is optional and an absent section
//! means the corresponding layer is left out. Durations are whole
//! milliseconds and the keys carry an `_ms` suffix.
//!
//! ```toml
//! [retry]
//! max_attempts = 4
//! base_delay_ms = 100
//! backoff = "exponential"
//! multiplier = 2.0
//! max_delay_ms = 5000
//! jitter = true
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! success_threshold = 2
//! timeout_ms = 30000
//! time_window_ms = 60000
//!
//! [bulkhead]
//! max_concurrent = 16
//! max_wait_ms = 250
//! execution_timeout_ms = 2000
//! max_queue = 64
//!
//! [adaptive]
//! max_attempts = 3
//! max_delay_ms = 10000
//! decay_factor = 0.9
//! frequency_weight = 0.1
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::adaptive::{AdaptiveConfig, AdaptiveRecovery};
use crate::bulkhead::{Bulkhead, BulkheadConfig};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::classifier::LayeredClassifier;
use crate::error::{ConfigError, ConfigResult};
use crate::orchestrator::{RecoveryOrchestrator, RecoveryOrchestratorBuilder};
use crate::retry::RetryPolicy;
use crate::utils::{duration_millis, option_duration_millis};

/// Configuration for all resilience layers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bulkhead: Option<BulkheadSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<AdaptiveSection>,
}

/// Backoff shape for the `[retry]` section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// `[retry]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    #[serde(rename = "base_delay_ms", with = "duration_millis")]
    pub base_delay: Duration,
    pub backoff: BackoffKind,
    /// Only used by exponential backoff
    pub multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "option_duration_millis")]
    pub max_delay: Option<Duration>,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff: BackoffKind::Exponential,
            multiplier: 2.0,
            max_delay: Some(Duration::from_secs(30)),
            jitter: false,
        }
    }
}

impl RetrySection {
    /// Runtime policy described by this section
    pub fn to_policy(&self) -> RetryPolicy {
        let policy = match self.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(self.max_attempts, self.base_delay),
            BackoffKind::Linear => RetryPolicy::linear(self.max_attempts, self.base_delay),
            BackoffKind::Exponential => {
                RetryPolicy::exponential(self.max_attempts, self.base_delay, self.multiplier)
            }
        };
        let policy = policy.with_jitter(self.jitter);
        match self.max_delay {
            Some(max_delay) => policy.with_max_delay(max_delay),
            None => policy,
        }
    }
}

/// `[circuit_breaker]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    #[serde(rename = "time_window_ms", with = "duration_millis")]
    pub time_window: Duration,
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            timeout: defaults.timeout,
            time_window: defaults.time_window,
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

impl From<&CircuitBreakerSection> for CircuitBreakerConfig {
    fn from(section: &CircuitBreakerSection) -> Self {
        Self {
            failure_threshold: section.failure_threshold,
            success_threshold: section.success_threshold,
            timeout: section.timeout,
            time_window: section.time_window,
            half_open_max_calls: section.half_open_max_calls,
        }
    }
}

/// `[bulkhead]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BulkheadSection {
    pub max_concurrent: usize,
    #[serde(rename = "max_wait_ms", with = "duration_millis")]
    pub max_wait: Duration,
    #[serde(rename = "execution_timeout_ms", with = "option_duration_millis")]
    pub execution_timeout: Option<Duration>,
    pub max_queue: Option<usize>,
}

impl Default for BulkheadSection {
    fn default() -> Self {
        let defaults = BulkheadConfig::default();
        Self {
            max_concurrent: defaults.max_concurrent,
            max_wait: defaults.max_wait,
            execution_timeout: defaults.execution_timeout,
            max_queue: defaults.max_queue,
        }
    }
}

impl From<&BulkheadSection> for BulkheadConfig {
    fn from(section: &BulkheadSection) -> Self {
        Self {
            max_concurrent: section.max_concurrent,
            max_wait: section.max_wait,
            execution_timeout: section.execution_timeout,
            max_queue: section.max_queue,
        }
    }
}

/// `[adaptive]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdaptiveSection {
    pub max_attempts: u32,
    #[serde(rename = "max_delay_ms", with = "option_duration_millis")]
    pub max_delay: Option<Duration>,
    pub decay_factor: f64,
    pub frequency_weight: f64,
}

impl Default for AdaptiveSection {
    fn default() -> Self {
        let defaults = AdaptiveConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            max_delay: defaults.max_delay,
            decay_factor: defaults.decay_factor,
            frequency_weight: defaults.frequency_weight,
        }
    }
}

impl From<&AdaptiveSection> for AdaptiveConfig {
    fn from(section: &AdaptiveSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            max_delay: section.max_delay,
            decay_factor: section.decay_factor,
            frequency_weight: section.frequency_weight,
        }
    }
}

impl ResilienceConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|error| ConfigError::Parse { message: error.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|error| ConfigError::Parse {
            message: format!("{}: {error}", path.display()),
        })?;
        debug!("Loaded resilience configuration from {}", path.display());
        Self::from_toml_str(&source)
    }

    /// Render as a TOML document
    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string(self).map_err(|error| ConfigError::Parse { message: error.to_string() })
    }

    /// Validate every present section
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(retry) = &self.retry {
            retry.to_policy().validate()?;
        }
        if let Some(breaker) = &self.circuit_breaker {
            CircuitBreakerConfig::from(breaker).validate()?;
        }
        if let Some(bulkhead) = &self.bulkhead {
            BulkheadConfig::from(bulkhead).validate()?;
        }
        if let Some(adaptive) = &self.adaptive {
            AdaptiveConfig::from(adaptive).validate()?;
        }
        Ok(())
    }

    /// Retry policy from the `[retry]` section
    pub fn retry_policy(&self) -> ConfigResult<Option<RetryPolicy>> {
        self.retry
            .as_ref()
            .map(|section| {
                let policy = section.to_policy();
                policy.validate().map(|()| policy)
            })
            .transpose()
    }

    /// Circuit breaker from the `[circuit_breaker]` section
    pub fn circuit_breaker(&self) -> ConfigResult<Option<CircuitBreaker>> {
        self.circuit_breaker.as_ref().map(|section| CircuitBreaker::new(section.into())).transpose()
    }

    /// Bulkhead from the `[bulkhead]` section
    pub fn bulkhead(&self) -> ConfigResult<Option<Bulkhead>> {
        self.bulkhead.as_ref().map(|section| Bulkhead::new(section.into())).transpose()
    }

    /// Adaptive recovery configuration from the `[adaptive]` section
    pub fn adaptive(&self) -> ConfigResult<Option<AdaptiveConfig>> {
        self.adaptive
            .as_ref()
            .map(|section| {
                let config = AdaptiveConfig::from(section);
                config.validate().map(|()| config)
            })
            .transpose()
    }

    /// Orchestrator builder with every configured layer in place
    ///
    /// `classifier` is only used when an `[adaptive]` section is present.
    /// Fallbacks can still be added to the returned builder.
    pub fn orchestrator<T, E, K>(&self, classifier: K) -> ConfigResult<RecoveryOrchestratorBuilder<T, E, K>> {
        let recovery = self
            .adaptive()?
            .map(|config| AdaptiveRecovery::new(config, LayeredClassifier::new(classifier)))
            .transpose()?;

        let mut builder = RecoveryOrchestrator::builder().optional_recovery(recovery);
        if let Some(bulkhead) = self.bulkhead()? {
            builder = builder.bulkhead(bulkhead);
        }
        Ok(match self.circuit_breaker()? {
            Some(breaker) => builder.circuit_breaker(breaker),
            None => builder,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::BackoffStrategy;

    #[test]
    fn test_empty_document_has_no_layers() {
        let config = ResilienceConfig::from_toml_str("").expect("empty config is valid");
        assert_eq!(config, ResilienceConfig::default());
        assert!(config.retry_policy().expect("valid").is_none());
        assert!(config.circuit_breaker().expect("valid").is_none());
    }

    #[test]
    fn test_sections_use_defaults_for_missing_keys() {
        let config = ResilienceConfig::from_toml_str("[circuit_breaker]\nfailure_threshold = 2\n")
            .expect("valid config");
        let section = config.circuit_breaker.expect("section present");

        assert_eq!(section.failure_threshold, 2);
        assert_eq!(section.success_threshold, 2);
        assert_eq!(section.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_retry_section_builds_policy() {
        let config = ResilienceConfig::from_toml_str(
            "[retry]\nmax_attempts = 3\nbase_delay_ms = 100\nbackoff = \"exponential\"\nmultiplier = 2.0\n",
        )
        .expect("valid config");
        let policy = config.retry_policy().expect("valid").expect("section present");

        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_linear_backoff_without_cap() {
        let section = RetrySection {
            backoff: BackoffKind::Linear,
            base_delay: Duration::from_millis(50),
            max_delay: None,
            ..RetrySection::default()
        };
        let policy = section.to_policy();

        assert_eq!(policy.backoff(), BackoffStrategy::Linear);
        assert_eq!(policy.delay(4), Duration::from_millis(200));
        assert!(policy.max_delay().is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let zero_attempts = ResilienceConfig::from_toml_str("[retry]\nmax_attempts = 0\n");
        assert!(matches!(zero_attempts, Err(ConfigError::Invalid { field: "max_attempts", .. })));

        let bad_decay = ResilienceConfig::from_toml_str("[adaptive]\ndecay_factor = 1.5\n");
        assert!(matches!(bad_decay, Err(ConfigError::Invalid { field: "decay_factor", .. })));
    }

    #[test]
    fn test_unknown_keys_are_parse_errors() {
        let result = ResilienceConfig::from_toml_str("[bulkhead]\nmax_concurent = 4\n");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_toml_round_trip_keeps_sections() {
        let config = ResilienceConfig {
            bulkhead: Some(BulkheadSection { max_queue: Some(8), ..BulkheadSection::default() }),
            ..ResilienceConfig::default()
        };

        let rendered = config.to_toml_string().expect("should render");
        assert!(rendered.contains("max_queue = 8"));
        assert_eq!(ResilienceConfig::from_toml_str(&rendered).expect("should parse"), config);
    }
}

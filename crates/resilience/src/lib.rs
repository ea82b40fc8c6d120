//! Composable resilience policies for fallible operations.
//!
//! Every layer is generic over the caller's error type and is usable on its
//! own or combined through [`RecoveryOrchestrator`]:
//! - **[`retry`]**: immutable retry schedules with fixed, linear or
//!   exponential backoff and optional jitter
//! - **[`circuit_breaker`]**: stop calling a failing dependency and probe it
//!   again after a cool-down
//! - **[`bulkhead`]**: bound concurrency with a fair, optionally bounded queue
//! - **[`classifier`]** and **[`adaptive`]**: severity-driven retries whose
//!   delays grow with the recent frequency of each error kind
//! - **[`fallback`]**: ordered alternatives tried after the primary fails
//! - **[`safe`]**: retries with a per-attempt timeout and panic capture
//!
//! Outcomes are plain `Result`s. Errors produced by a layer itself are
//! variants of [`ResilienceError`], which wraps the operation's own error in
//! [`ResilienceError::Operation`].
//!
//! # Feature Flags
//!
//! - `config` (default): TOML loading of [`config::ResilienceConfig`]
//! - `test-utils`: the `testing` module with scripted operations and timing
//!   assertions

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod adaptive;
pub mod bulkhead;
pub mod circuit_breaker;
pub mod classifier;
pub mod clock;
pub mod error;
pub mod fallback;
pub mod orchestrator;
pub mod retry;
pub mod safe;
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

#[cfg(feature = "config")]
pub mod config;
#[cfg(feature = "config")]
pub mod utils;

pub use adaptive::{AdaptiveConfig, AdaptiveRecovery, RecoveryStatistics};
pub use bulkhead::{Bulkhead, BulkheadConfig, BulkheadMetrics};
pub use circuit_breaker::{
    CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
pub use classifier::{
    Classify, DefaultClassifier, ErrorClassifier, FnClassifier, LayeredClassifier, NeverRetry,
    Severity,
};
pub use clock::{Clock, MockClock, SystemClock};
#[cfg(feature = "config")]
pub use config::ResilienceConfig;
pub use error::{BoxedError, ConfigError, ConfigResult, ResilienceError, ResilienceResult, SafeError};
pub use fallback::FallbackChain;
pub use orchestrator::{LayeredRecovery, RecoveryOrchestrator, RecoveryOrchestratorBuilder};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use safe::{SafeExecutor, SafeExecutorBuilder};

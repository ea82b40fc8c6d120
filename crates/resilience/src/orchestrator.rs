//! Composition of every resilience layer around one operation
//!
//! Layers, outermost first:
//!
//! ```text
//! FallbackChain → AdaptiveRecovery → CircuitBreaker → Bulkhead → operation
//! ```
//!
//! The bulkhead gates admission before anything touches the resource. The
//! circuit breaker sits directly above it so it counts real call attempts,
//! never fallback results. Adaptive recovery retries inside a circuit that is
//! still letting calls through, and treats an open circuit as permanent. The
//! fallback chain runs only once every inner layer has given up. Layers that
//! are not configured are skipped.

use std::fmt;
use std::future::Future;

use tracing::{debug, instrument};

use crate::adaptive::{AdaptiveConfig, AdaptiveRecovery};
use crate::bulkhead::Bulkhead;
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{ErrorClassifier, LayeredClassifier, NeverRetry};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigResult, ResilienceError, ResilienceResult};
use crate::fallback::FallbackChain;

/// Adaptive recovery as used inside the orchestrator
pub type LayeredRecovery<K> = AdaptiveRecovery<LayeredClassifier<K>>;

/// Every configured resilience layer around one kind of operation
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use bulwark_resilience::{
///     AdaptiveConfig, BulkheadConfig, Bulkhead, CircuitBreaker, CircuitBreakerConfig,
///     DefaultClassifier, RecoveryOrchestrator,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = RecoveryOrchestrator::builder()
///     .bulkhead(Bulkhead::new(BulkheadConfig::new(8, Duration::from_secs(1)))?)
///     .circuit_breaker(CircuitBreaker::new(CircuitBreakerConfig::default())?)
///     .adaptive_recovery(AdaptiveConfig::default(), DefaultClassifier::default())?
///     .fallback_value("stale".to_string())
///     .build();
///
/// let value = orchestrator
///     .execute(|| async { Err::<String, _>(std::io::Error::other("backend down")) })
///     .await?;
/// assert_eq!(value, "stale");
/// # Ok(())
/// # }
/// ```
pub struct RecoveryOrchestrator<T, E, K = NeverRetry, C: Clock = SystemClock> {
    bulkhead: Option<Bulkhead>,
    circuit_breaker: Option<CircuitBreaker<C>>,
    recovery: Option<LayeredRecovery<K>>,
    fallback: Option<FallbackChain<T, ResilienceError<E>>>,
}

impl<T, E, K, C: Clock> fmt::Debug for RecoveryOrchestrator<T, E, K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("bulkhead", &self.bulkhead)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("recovery", &self.recovery)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl<T, E> RecoveryOrchestrator<T, E> {
    /// Start configuring an orchestrator with no layers
    pub fn builder() -> RecoveryOrchestratorBuilder<T, E> {
        RecoveryOrchestratorBuilder::new()
    }
}

impl<T, E, K, C: Clock> RecoveryOrchestrator<T, E, K, C> {
    pub fn bulkhead(&self) -> Option<&Bulkhead> {
        self.bulkhead.as_ref()
    }

    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker<C>> {
        self.circuit_breaker.as_ref()
    }

    pub fn recovery(&self) -> Option<&LayeredRecovery<K>> {
        self.recovery.as_ref()
    }

    pub fn fallback(&self) -> Option<&FallbackChain<T, ResilienceError<E>>> {
        self.fallback.as_ref()
    }

    /// Run `operation` through every configured layer
    ///
    /// The operation may be invoked several times when adaptive recovery is
    /// configured, and not at all when the circuit is open.
    #[instrument(
        skip_all,
        fields(
            bulkhead = self.bulkhead.is_some(),
            circuit_breaker = self.circuit_breaker.is_some(),
            recovery = self.recovery.is_some(),
            fallbacks = self.fallback.as_ref().map_or(0, FallbackChain::len),
        )
    )]
    pub async fn execute<F, Fut>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Send + 'static,
        E: fmt::Debug + Send + 'static,
        K: ErrorClassifier<E>,
    {
        let operation = &operation;
        let recovered = move || self.call_with_recovery(operation);

        match &self.fallback {
            Some(chain) if !chain.is_empty() => chain.execute(recovered).await,
            _ => recovered().await,
        }
    }

    async fn call_with_recovery<F, Fut>(&self, operation: &F) -> ResilienceResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug,
        K: ErrorClassifier<E>,
    {
        match &self.recovery {
            Some(recovery) => recovery.execute(move || self.call_protected(operation)).await,
            None => self.call_protected(operation).await,
        }
    }

    async fn call_protected<F, Fut>(&self, operation: &F) -> ResilienceResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug,
    {
        match &self.circuit_breaker {
            Some(breaker) => breaker.execute_guarded(move || self.call_admitted(operation)).await,
            None => self.call_admitted(operation).await,
        }
    }

    async fn call_admitted<F, Fut>(&self, operation: &F) -> ResilienceResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match &self.bulkhead {
            Some(bulkhead) => bulkhead.execute(operation).await,
            None => {
                debug!("No bulkhead configured, calling operation directly");
                operation().await.map_err(ResilienceError::Operation)
            }
        }
    }
}

/// Builder for [`RecoveryOrchestrator`]
///
/// Adding a circuit breaker with a custom clock or adaptive recovery with a
/// custom classifier changes the builder's type parameters accordingly.
pub struct RecoveryOrchestratorBuilder<T, E, K = NeverRetry, C: Clock = SystemClock> {
    bulkhead: Option<Bulkhead>,
    circuit_breaker: Option<CircuitBreaker<C>>,
    recovery: Option<LayeredRecovery<K>>,
    fallback: Option<FallbackChain<T, ResilienceError<E>>>,
}

impl<T, E> Default for RecoveryOrchestratorBuilder<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> RecoveryOrchestratorBuilder<T, E> {
    pub fn new() -> Self {
        Self { bulkhead: None, circuit_breaker: None, recovery: None, fallback: None }
    }
}

impl<T, E, K, C: Clock> fmt::Debug for RecoveryOrchestratorBuilder<T, E, K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOrchestratorBuilder")
            .field("bulkhead", &self.bulkhead.is_some())
            .field("circuit_breaker", &self.circuit_breaker.is_some())
            .field("recovery", &self.recovery.is_some())
            .field("fallbacks", &self.fallback.as_ref().map_or(0, FallbackChain::len))
            .finish()
    }
}

impl<T, E, K, C: Clock> RecoveryOrchestratorBuilder<T, E, K, C> {
    /// Gate admission with `bulkhead`
    pub fn bulkhead(mut self, bulkhead: Bulkhead) -> Self {
        self.bulkhead = Some(bulkhead);
        self
    }

    /// Guard calls with `breaker`
    pub fn circuit_breaker<C2: Clock>(
        self,
        breaker: CircuitBreaker<C2>,
    ) -> RecoveryOrchestratorBuilder<T, E, K, C2> {
        RecoveryOrchestratorBuilder {
            bulkhead: self.bulkhead,
            circuit_breaker: Some(breaker),
            recovery: self.recovery,
            fallback: self.fallback,
        }
    }

    /// Retry with adaptive recovery built from `config` and `classifier`
    pub fn adaptive_recovery<K2>(
        self,
        config: AdaptiveConfig,
        classifier: K2,
    ) -> ConfigResult<RecoveryOrchestratorBuilder<T, E, K2, C>> {
        let recovery = AdaptiveRecovery::new(config, LayeredClassifier::new(classifier))?;
        Ok(self.recovery(recovery))
    }

    /// Retry with an existing adaptive recovery instance (sharing its history)
    pub fn recovery<K2>(self, recovery: LayeredRecovery<K2>) -> RecoveryOrchestratorBuilder<T, E, K2, C> {
        self.optional_recovery(Some(recovery))
    }

    #[cfg_attr(not(feature = "config"), allow(dead_code))]
    pub(crate) fn optional_recovery<K2>(
        self,
        recovery: Option<LayeredRecovery<K2>>,
    ) -> RecoveryOrchestratorBuilder<T, E, K2, C> {
        RecoveryOrchestratorBuilder {
            bulkhead: self.bulkhead,
            circuit_breaker: self.circuit_breaker,
            recovery,
            fallback: self.fallback,
        }
    }

    /// Replace the fallback chain
    pub fn fallback_chain(mut self, chain: FallbackChain<T, ResilienceError<E>>) -> Self {
        self.fallback = Some(chain);
        self
    }

    pub fn build(self) -> RecoveryOrchestrator<T, E, K, C> {
        RecoveryOrchestrator {
            bulkhead: self.bulkhead,
            circuit_breaker: self.circuit_breaker,
            recovery: self.recovery,
            fallback: self.fallback,
        }
    }
}

impl<T, E, K, C: Clock> RecoveryOrchestratorBuilder<T, E, K, C>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn push_fallback(
        mut self,
        add: impl FnOnce(FallbackChain<T, ResilienceError<E>>) -> FallbackChain<T, ResilienceError<E>>,
    ) -> Self {
        let chain = self.fallback.take().unwrap_or_default();
        self.fallback = Some(add(chain));
        self
    }

    /// Append an alternative operation tried after the inner layers give up
    pub fn fallback<F, Fut>(self, fallback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.push_fallback(|chain| {
            chain.then(move || {
                let attempt = fallback();
                async move { attempt.await.map_err(ResilienceError::Operation) }
            })
        })
    }

    /// Append an alternative that receives the error it replaces
    pub fn fallback_with<F, Fut>(self, fallback: F) -> Self
    where
        F: Fn(&ResilienceError<E>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.push_fallback(|chain| {
            chain.then_with(move |previous: &ResilienceError<E>| {
                let attempt = fallback(previous);
                async move { attempt.await.map_err(ResilienceError::Operation) }
            })
        })
    }

    /// Append a constant that always succeeds
    pub fn fallback_value(self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.push_fallback(|chain| chain.then_value(value))
    }
}

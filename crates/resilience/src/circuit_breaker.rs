//! Circuit breaker
//!
//! Guards a resource from cascading failures with a three-state machine:
//!
//! - **Closed**: calls pass through; consecutive failures inside
//!   `time_window` are counted and the circuit opens at `failure_threshold`.
//! - **Open**: calls are rejected with [`ResilienceError::CircuitOpen`] without
//!   running the operation. The first call after `timeout` has elapsed moves
//!   the circuit to half-open and is itself executed as the probe.
//! - **HalfOpen**: at most `half_open_max_calls` probes run at once; a single
//!   failure reopens the circuit, `success_threshold` successes close it.
//!
//! All counters and the state live behind one mutex per breaker, so every
//! read-modify-transition is atomic relative to concurrent callers. Clones
//! share that state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ConfigResult, ResilienceError, ResilienceResult};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing probe requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u64,
    /// Number of successes needed to close the circuit from half-open
    pub success_threshold: u64,
    /// Time to wait before transitioning from open to half-open
    pub timeout: Duration,
    /// Failures further apart than this do not accumulate
    pub time_window: Duration,
    /// Maximum number of probes in flight while half-open
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            time_window: Duration::from_secs(60),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold", "must be greater than 0"));
        }

        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold", "must be greater than 0"));
        }

        if self.half_open_max_calls == 0 {
            return Err(ConfigError::invalid("half_open_max_calls", "must be greater than 0"));
        }

        if self.time_window.is_zero() {
            return Err(ConfigError::invalid("time_window", "must be greater than zero"));
        }

        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerConfigBuilder {
    /// Start from the default configuration
    pub fn new() -> Self {
        Self { config: CircuitBreakerConfig::default() }
    }

    /// Failures inside `time_window` that open the circuit
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Half-open successes needed to close the circuit
    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Cool-down before an open circuit admits a trial call
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Span over which closed-state failures accumulate
    pub fn time_window(mut self, window: Duration) -> Self {
        self.config.time_window = window;
        self
    }

    /// Calls allowed in flight while half-open
    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// Validate and return the configuration
    pub fn build(self) -> ConfigResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// Current state
    pub state: CircuitState,
    /// Failures counted toward opening the circuit
    pub failure_count: u64,
    /// Half-open successes counted toward closing it
    pub success_count: u64,
    /// Calls admitted since creation
    pub total_calls: u64,
    /// Calls rejected without running
    pub rejected_calls: u64,
    /// When the last failure was reported
    pub last_failure_time: Option<Instant>,
    /// When the circuit last changed state
    pub state_change_time: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    state_change_time: Instant,
    window_start: Option<Instant>,
    probes_in_flight: u64,
    // Bumped on every transition. Outcomes of permits issued under an older
    // generation are ignored.
    generation: u64,
    total_calls: u64,
    rejected_calls: u64,
    last_failure_time: Option<Instant>,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            state_change_time: now,
            window_start: None,
            probes_in_flight: 0,
            generation: 0,
            total_calls: 0,
            rejected_calls: 0,
            last_failure_time: None,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) {
        self.state = to;
        self.state_change_time = now;
        self.generation += 1;
        self.probes_in_flight = 0;
        self.success_count = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
            self.window_start = None;
        }
    }
}

/// Generic circuit breaker implementation
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use bulwark_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let config = CircuitBreakerConfig::builder()
///     .failure_threshold(2)
///     .timeout(Duration::from_secs(30))
///     .build()?;
/// let breaker = CircuitBreaker::new(config)?;
///
/// for _ in 0..2 {
///     let _ = breaker.call(|| Err::<(), _>(std::io::Error::other("down")));
/// }
/// assert_eq!(breaker.state(), CircuitState::Open);
/// # Ok::<(), bulwark_resilience::ConfigError>(())
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .field("success_count", &inner.success_count)
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            inner: Arc::clone(&self.inner),
            clock: Arc::clone(&self.clock),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a new circuit breaker using the system clock
    pub fn new(config: CircuitBreakerConfig) -> ConfigResult<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// Create a configuration builder
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }
}

impl Default for CircuitBreaker<SystemClock> {
    fn default() -> Self {
        let config = CircuitBreakerConfig::default();
        let now = SystemClock.now();
        Self { config, inner: Arc::new(Mutex::new(BreakerState::new(now))), clock: Arc::new(SystemClock) }
    }
}

/// State period a permit was issued in
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    half_open: bool,
}

/// Admission ticket for one call through the breaker
///
/// The outcome only counts if the circuit has not changed state since the
/// permit was issued. Dropping a permit without reporting an outcome (the
/// caller's future was cancelled) frees its half-open slot without counting
/// a success or failure.
#[must_use = "report the call outcome with `success` or `failure`"]
pub struct CallPermit<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    admission: Option<Admission>,
}

impl<C: Clock> CallPermit<'_, C> {
    /// Record that the guarded call succeeded
    pub fn success(mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.on_success(Some(admission));
        }
    }

    /// Record that the guarded call failed
    pub fn failure(mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.on_failure(Some(admission));
        }
    }

    /// Release the permit without counting the call either way
    pub fn release(self) {}
}

impl<C: Clock> Drop for CallPermit<'_, C> {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            let mut inner = self.breaker.inner.lock();
            admit_outcome(&mut inner, admission);
        }
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a new circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> ConfigResult<Self> {
        config.validate()?;

        let now = clock.now();
        Ok(Self { config, inner: Arc::new(Mutex::new(BreakerState::new(now))), clock: Arc::new(clock) })
    }

    /// Active configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Try to admit one call
    ///
    /// In the open state this is where the cool-down is checked: once
    /// `timeout` has elapsed the circuit moves to half-open and the caller
    /// receives the probe permit. On rejection the error carries the time
    /// left until the next probe is allowed.
    pub fn try_acquire(&self) -> Result<CallPermit<'_, C>, Duration> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.total_calls += 1;
                Ok(self.permit(&inner))
            }
            CircuitState::Open => {
                let elapsed = now.saturating_duration_since(inner.state_change_time);
                if elapsed >= self.config.timeout {
                    inner.transition(CircuitState::HalfOpen, now);
                    inner.probes_in_flight = 1;
                    inner.total_calls += 1;
                    info!("Circuit breaker half-open after {:?}, admitting probe", elapsed);
                    Ok(self.permit(&inner))
                } else {
                    inner.rejected_calls += 1;
                    Err(self.config.timeout - elapsed)
                }
            }
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_calls {
                    inner.probes_in_flight += 1;
                    inner.total_calls += 1;
                    Ok(self.permit(&inner))
                } else {
                    inner.rejected_calls += 1;
                    Err(Duration::ZERO)
                }
            }
        }
    }

    fn permit(&self, inner: &BreakerState) -> CallPermit<'_, C> {
        let admission =
            Admission { generation: inner.generation, half_open: inner.state == CircuitState::HalfOpen };
        CallPermit { breaker: self, admission: Some(admission) }
    }

    /// Check if a call would currently be admitted
    ///
    /// Unlike [`try_acquire`](Self::try_acquire) this never transitions
    /// state and never reserves a probe slot.
    pub fn is_available(&self) -> bool {
        let now = self.clock.now();
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                now.saturating_duration_since(inner.state_change_time) >= self.config.timeout
            }
            CircuitState::HalfOpen => inner.probes_in_flight < self.config.half_open_max_calls,
        }
    }

    /// Execute an operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Debug,
    {
        self.execute_guarded(|| async move { operation().await.map_err(ResilienceError::Operation) })
            .await
    }

    /// Execute an operation that already speaks [`ResilienceError`]
    ///
    /// Used when the breaker wraps another resilience layer. Operation
    /// failures, timeouts and panics count against the circuit; bulkhead
    /// rejections mean the resource was never called and are not counted.
    pub async fn execute_guarded<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T, E>>,
        E: fmt::Debug,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(remaining) => {
                debug!("Circuit breaker rejecting call - retry in {:?}", remaining);
                return Err(ResilienceError::CircuitOpen { remaining });
            }
        };

        let result = operation().await;
        self.settle(permit, &result);
        result
    }

    /// Execute a synchronous operation with circuit breaker protection
    #[instrument(skip(self, operation), fields(state = %self.state()))]
    pub fn call<F, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: fmt::Debug,
    {
        let permit = match self.try_acquire() {
            Ok(permit) => permit,
            Err(remaining) => {
                debug!("Circuit breaker rejecting call - retry in {:?}", remaining);
                return Err(ResilienceError::CircuitOpen { remaining });
            }
        };

        let result = operation().map_err(ResilienceError::Operation);
        self.settle(permit, &result);
        result
    }

    fn settle<T, E: fmt::Debug>(&self, permit: CallPermit<'_, C>, result: &ResilienceResult<T, E>) {
        match result {
            Ok(_) => {
                debug!("Circuit breaker: operation succeeded");
                permit.success();
            }
            Err(error) if error.is_bulkhead_rejection() || error.is_circuit_open() => {
                debug!("Circuit breaker: call never reached the resource - {:?}", error);
                permit.release();
            }
            Err(error) => {
                warn!("Circuit breaker: operation failed - {:?}", error);
                permit.failure();
            }
        }
    }

    /// Record a successful operation outside of `execute`/`call`
    pub fn record_success(&self) {
        self.on_success(None);
    }

    /// Record a failed operation outside of `execute`/`call`
    pub fn record_failure(&self) {
        self.on_failure(None);
    }

    fn on_success(&self, admission: Option<Admission>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if let Some(admission) = admission {
            if !admit_outcome(&mut inner, admission) {
                debug!("Ignoring success of a call admitted before the last state change");
                return;
            }
        }

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.window_start = None;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    let successes = inner.success_count;
                    inner.transition(CircuitState::Closed, now);
                    info!("Circuit breaker closed after {} successes", successes);
                }
            }
            CircuitState::Open => {
                debug!("Ignoring success reported while circuit is open");
            }
        }
    }

    fn on_failure(&self, admission: Option<Admission>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(now);
        if let Some(admission) = admission {
            if !admit_outcome(&mut inner, admission) {
                debug!("Ignoring failure of a call admitted before the last state change");
                return;
            }
        }

        match inner.state {
            CircuitState::Closed => {
                let window_expired = inner
                    .window_start
                    .map_or(true, |start| now.saturating_duration_since(start) > self.config.time_window);
                if window_expired {
                    inner.window_start = Some(now);
                    inner.failure_count = 0;
                }

                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    let failures = inner.failure_count;
                    inner.transition(CircuitState::Open, now);
                    warn!("Circuit breaker opened after {} failures", failures);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.transition(CircuitState::Open, now);
                warn!("Circuit breaker opened due to failure in half-open state");
            }
            CircuitState::Open => {}
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get circuit breaker metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        CircuitBreakerMetrics {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_calls: inner.total_calls,
            rejected_calls: inner.rejected_calls,
            last_failure_time: inner.last_failure_time,
            state_change_time: inner.state_change_time,
        }
    }

    /// Force the circuit closed with zeroed counters
    pub fn reset(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.transition(CircuitState::Closed, now);
        inner.last_failure_time = None;
        info!("Circuit breaker manually reset to closed state");
    }
}

/// Free the admission's half-open slot; false if the circuit has moved on
fn admit_outcome(inner: &mut BreakerState, admission: Admission) -> bool {
    if admission.generation != inner.generation {
        return false;
    }
    if admission.half_open {
        inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
    }
    true
}

//! Integration tests for the resilience layers
//!
//! Exercises the layers together through the public API, on a multi-threaded
//! runtime with real concurrency.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bulwark_resilience::testing::ScriptedOperation;
use bulwark_resilience::{
    AdaptiveConfig, Bulkhead, BulkheadConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState,
    DefaultClassifier, FallbackChain, MockClock, RecoveryOrchestrator, ResilienceError,
    RetryPolicy, SafeError, SafeExecutor, Severity,
};

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "upstream timed out")
}

fn fast_classifier() -> DefaultClassifier {
    DefaultClassifier::new(Duration::from_millis(1), Duration::from_millis(5))
}

/// Validates that adaptive recovery inside the orchestrator retries transient
/// failures, and that the circuit breaker below it sees every real attempt.
///
/// # Test Steps
/// 1. Script two timeouts followed by a success
/// 2. Run through breaker (threshold 5) and adaptive recovery (3 attempts)
/// 3. Verify the success value and three operation calls
/// 4. Verify the breaker recorded all three calls and stayed closed
/// 5. Verify the recovered call left no adaptive error history
#[tokio::test(flavor = "multi_thread")]
async fn test_orchestrator_recovers_transient_failures() {
    init_test_tracing();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::default()).expect("valid config");
    let orchestrator = RecoveryOrchestrator::builder()
        .circuit_breaker(breaker.clone())
        .adaptive_recovery(AdaptiveConfig::default(), fast_classifier())
        .expect("valid adaptive config")
        .build();

    let op = ScriptedOperation::new([Err(timed_out().kind()), Err(timed_out().kind()), Ok("fresh")]);
    let result = orchestrator.execute(|| async { op.call().await.map_err(io::Error::from) }).await;

    assert_eq!(result.expect("should recover"), "fresh");
    assert_eq!(op.calls(), 3);

    let metrics = breaker.metrics();
    assert_eq!(metrics.total_calls, 3);
    assert_eq!(metrics.state, CircuitState::Closed);

    let statistics = orchestrator.recovery().expect("recovery configured").statistics();
    assert!(statistics.is_empty(), "a recovered call leaves no error history");
}

/// Validates the full open → half-open → closed cycle under the orchestrator,
/// with the fallback chain serving callers while the circuit is open.
#[tokio::test(flavor = "multi_thread")]
async fn test_open_circuit_served_by_fallback_then_recovers() {
    init_test_tracing();
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(2)
        .success_threshold(1)
        .timeout(Duration::from_secs(30))
        .build()
        .expect("valid config");
    let breaker = CircuitBreaker::with_clock(config, clock.clone()).expect("valid config");

    let orchestrator = RecoveryOrchestrator::builder()
        .circuit_breaker(breaker.clone())
        .fallback_value("cached")
        .build();

    let backend_calls = Arc::new(AtomicU32::new(0));
    let healthy = Arc::new(AtomicU32::new(0));
    let call_backend = || {
        let backend_calls = Arc::clone(&backend_calls);
        let healthy = Arc::clone(&healthy);
        move || {
            backend_calls.fetch_add(1, Ordering::SeqCst);
            let up = healthy.load(Ordering::SeqCst) == 1;
            async move {
                if up {
                    Ok("live")
                } else {
                    Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
                }
            }
        }
    };

    for _ in 0..2 {
        let value = orchestrator.execute(call_backend()).await.expect("fallback should serve");
        assert_eq!(value, "cached");
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let value = orchestrator.execute(call_backend()).await.expect("fallback should serve");
    assert_eq!(value, "cached");
    assert_eq!(backend_calls.load(Ordering::SeqCst), 2, "open circuit must not call the backend");

    healthy.store(1, Ordering::SeqCst);
    clock.advance(Duration::from_secs(30));

    let value = orchestrator.execute(call_backend()).await.expect("probe should succeed");
    assert_eq!(value, "live");
    assert_eq!(breaker.state(), CircuitState::Closed);
}

/// Validates that the bulkhead never admits more than `max_concurrent`
/// operations across tasks, and that every task eventually completes.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bulkhead_bounds_concurrency_across_tasks() {
    let bulkhead = Bulkhead::new(BulkheadConfig::new(3, Duration::from_secs(5))).expect("valid config");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for index in 0..12_usize {
        let bulkhead = bulkhead.clone();
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        handles.push(tokio::spawn(async move {
            bulkhead
                .execute(|| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, io::Error>(index)
                })
                .await
        }));
    }

    for handle in handles {
        handle.await.expect("task should not panic").expect("should be admitted");
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    let metrics = bulkhead.metrics();
    assert_eq!(metrics.total_operations, 12);
    assert_eq!(metrics.rejected_operations, 0);
    assert_eq!(bulkhead.available_slots(), 3);
}

/// Validates that a saturated bulkhead below the breaker does not trip it.
#[tokio::test(flavor = "multi_thread")]
async fn test_bulkhead_rejections_do_not_open_circuit() {
    let bulkhead = Bulkhead::new(
        BulkheadConfig::builder()
            .max_concurrent(1)
            .max_wait(Duration::from_millis(5))
            .build()
            .expect("valid config"),
    )
    .expect("valid config");
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder().failure_threshold(1).build().expect("valid config"),
    )
    .expect("valid config");
    let orchestrator =
        RecoveryOrchestrator::builder().bulkhead(bulkhead.clone()).circuit_breaker(breaker.clone()).build();

    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
    let holder = {
        let bulkhead = bulkhead.clone();
        tokio::spawn(async move {
            bulkhead
                .execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, io::Error>(())
                })
                .await
        })
    };
    while bulkhead.available_slots() > 0 {
        tokio::task::yield_now().await;
    }

    let result = orchestrator.execute(|| async { Ok::<_, io::Error>(()) }).await;
    assert!(matches!(result, Err(ResilienceError::BulkheadTimeout { .. })));
    assert_eq!(breaker.state(), CircuitState::Closed);

    release_tx.send(()).expect("holder should still be waiting");
    holder.await.expect("task should not panic").expect("holder admitted");
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("fetch failed: {0}")]
    Safe(#[from] SafeError),
}

/// Validates that the safe executor survives panics and times out hung
/// attempts before eventually succeeding.
#[tokio::test(flavor = "multi_thread")]
async fn test_safe_executor_survives_panic_and_hang() {
    init_test_tracing();
    let executor: SafeExecutor<FetchError> = SafeExecutor::builder()
        .retry_policy(RetryPolicy::fixed(3, Duration::from_millis(1)))
        .timeout(Duration::from_millis(20))
        .build()
        .expect("valid config");

    let attempts = Arc::new(AtomicU32::new(0));
    let result = executor
        .execute(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                match attempt {
                    1 => panic!("first attempt explodes"),
                    2 => {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        Ok(0)
                    }
                    _ => Ok::<_, io::Error>(attempt),
                }
            }
        })
        .await;

    assert_eq!(result.expect("third attempt succeeds"), 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_safe_executor_maps_final_error() {
    let executor: SafeExecutor<FetchError> = SafeExecutor::builder()
        .retry_policy(RetryPolicy::fixed(2, Duration::ZERO))
        .build()
        .expect("valid config");

    let result: Result<(), FetchError> = executor.execute(|| async { Err(timed_out()) }).await;

    let FetchError::Safe(error) = result.expect_err("every attempt fails");
    assert_eq!(error.kind(), "failed");
    assert_eq!(
        error.downcast_ref::<io::Error>().map(io::Error::kind),
        Some(io::ErrorKind::TimedOut)
    );
}

/// Validates that clones of one breaker share state across tasks.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_breaker_clones_share_state_across_tasks() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder().failure_threshold(8).build().expect("valid config"),
    )
    .expect("valid config");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let breaker = breaker.clone();
        handles.push(tokio::spawn(async move {
            let _ = breaker.execute(|| async { Err::<(), _>(timed_out()) }).await;
        }));
    }
    for handle in handles {
        handle.await.expect("task should not panic");
    }

    assert_eq!(breaker.state(), CircuitState::Open);
    let rejected = breaker.execute(|| async { Ok::<_, io::Error>(()) }).await;
    assert!(rejected.expect_err("circuit is open").is_circuit_open());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fallback_chain_standalone_with_classified_errors() {
    let classifier = fast_classifier();
    let chain = FallbackChain::new()
        .then_with(move |previous: &io::Error| {
            let retryable =
                bulwark_resilience::ErrorClassifier::classify(&classifier, previous) == Severity::Transient;
            async move {
                if retryable {
                    Ok("replica")
                } else {
                    Err(io::Error::other("replica unavailable"))
                }
            }
        })
        .then_value("static");

    assert_eq!(chain.execute(|| async { Err(timed_out()) }).await.expect("replica"), "replica");

    let permanent = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
    assert_eq!(chain.execute(|| async { Err(permanent) }).await.expect("static"), "static");
}

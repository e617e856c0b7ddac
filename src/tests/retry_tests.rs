// src/tests/retry_tests.rs

use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::context::RequestContext;
use crate::error::{ErrorClass, GuardError, UpstreamError};
use crate::health::{HealthMonitor, HealthProbeConfig, HealthStatus};
use crate::metrics::{MetricsCollector, MetricsFilter, MetricType};
use crate::monitoring::{AlertThresholds, MonitoringService};
use crate::retry::{compute_delay, RetryExecutor, RetryPolicy, RetryPolicyTable};
use crate::test_utils::{auth_error, fast_policy, server_error, MockUpstream};

struct Stack {
    executor: RetryExecutor,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    monitoring: Arc<MonitoringService>,
}

fn stack(failure_threshold: usize, policies: RetryPolicyTable, timeout: Duration) -> Stack {
    let name = "llm";
    let metrics = Arc::new(MetricsCollector::new(1000, 16));
    let monitoring = Arc::new(MonitoringService::new(100, 100));
    monitoring.register_dependency(name, AlertThresholds::default());

    let breaker = Arc::new(CircuitBreaker::new(
        name,
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_millis(100),
            half_open_max_calls: 2,
        },
    ));
    let health = Arc::new(HealthMonitor::new(
        name,
        HealthProbeConfig::default(),
        Arc::clone(&metrics),
        Arc::clone(&monitoring),
    ));
    let executor = RetryExecutor::new(
        name,
        policies,
        timeout,
        Arc::clone(&breaker),
        Arc::clone(&health),
        Arc::clone(&metrics),
        Arc::clone(&monitoring),
    );

    Stack {
        executor,
        breaker,
        health,
        metrics,
        monitoring,
    }
}

fn fast_table(max_retries: usize) -> RetryPolicyTable {
    RetryPolicyTable::default().with_policy(ErrorClass::Default, fast_policy(max_retries))
}

#[test]
fn test_compute_delay_is_exponential_without_jitter() {
    let policy = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_secs(1),
        backoff_multiplier: 2.0,
        jitter_fraction: 0.0,
        max_delay: Duration::from_secs(30),
    };

    assert_eq!(compute_delay(&policy, 0), Duration::from_secs(1));
    assert_eq!(compute_delay(&policy, 1), Duration::from_secs(2));
    assert_eq!(compute_delay(&policy, 2), Duration::from_secs(4));
}

#[test]
fn test_compute_delay_caps_at_max_delay() {
    let policy = RetryPolicy {
        max_retries: 10,
        base_delay: Duration::from_secs(1),
        backoff_multiplier: 10.0,
        jitter_fraction: 0.0,
        max_delay: Duration::from_secs(5),
    };

    assert_eq!(compute_delay(&policy, 6), Duration::from_secs(5));
}

#[test]
fn test_compute_delay_jitter_stays_within_bounds() {
    let policy = RetryPolicy {
        max_retries: 5,
        base_delay: Duration::from_secs(1),
        backoff_multiplier: 1.0,
        jitter_fraction: 0.5,
        max_delay: Duration::from_secs(10),
    };

    for _ in 0..100 {
        let delay = compute_delay(&policy, 0);
        assert!(delay >= Duration::from_millis(500), "delay {:?} below jitter floor", delay);
        assert!(delay <= Duration::from_millis(1500), "delay {:?} above jitter ceiling", delay);
    }
}

#[test]
fn test_policy_table_falls_back_to_default_entry() {
    let table = RetryPolicyTable::default()
        .with_policy(ErrorClass::Default, fast_policy(7))
        .with_policy(ErrorClass::RateLimit, fast_policy(2));

    assert_eq!(table.policy_for(ErrorClass::RateLimit).max_retries, 2);
    // No explicit timeout entry: the default one applies
    assert_eq!(table.policy_for(ErrorClass::Timeout).max_retries, 7);
}

#[test]
fn test_error_classification() {
    assert_eq!(
        UpstreamError::Timeout {
            elapsed: Duration::from_secs(1)
        }
        .class(),
        ErrorClass::Timeout
    );
    assert_eq!(
        UpstreamError::Connection("refused".into()).class(),
        ErrorClass::Connection
    );
    assert_eq!(
        UpstreamError::RateLimited { retry_after: None }.class(),
        ErrorClass::RateLimit
    );
    assert_eq!(server_error().class(), ErrorClass::ServerError);
    assert_eq!(
        UpstreamError::Other("weird".into()).class(),
        ErrorClass::Default
    );

    assert_eq!(auth_error().class(), ErrorClass::Default);
    assert!(!auth_error().is_retryable());
    assert!(server_error().is_retryable());
}

#[traced_test]
#[tokio::test]
async fn test_success_on_first_attempt() {
    let stack = stack(5, fast_table(3), Duration::from_secs(1));
    let upstream = Arc::new(MockUpstream::new());
    let ctx = RequestContext::new("generate");

    let upstream_ref = Arc::clone(&upstream);
    let result = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert_eq!(upstream.calls(), 1);
    assert_eq!(stack.breaker.state().await, CircuitState::Closed);

    let usage = stack.monitoring.get_metrics("llm").unwrap();
    assert_eq!(usage.total_requests, 1);
    assert_eq!(usage.successful_requests, 1);

    // Every completed attempt emits the uniform call event
    assert!(logs_contain("Guarded upstream call"));
}

#[traced_test]
#[tokio::test]
async fn test_unregistered_dependency_still_executes_and_warns() {
    // No register_dependency call: usage accounting has nowhere to go,
    // but execution itself must not be affected
    let metrics = Arc::new(MetricsCollector::new(100, 16));
    let monitoring = Arc::new(MonitoringService::new(100, 100));
    let breaker = Arc::new(CircuitBreaker::new("brand", CircuitBreakerConfig::default()));
    let health = Arc::new(HealthMonitor::new(
        "brand",
        HealthProbeConfig::default(),
        Arc::clone(&metrics),
        Arc::clone(&monitoring),
    ));
    let executor = RetryExecutor::new(
        "brand",
        fast_table(3),
        Duration::from_secs(1),
        breaker,
        health,
        Arc::clone(&metrics),
        monitoring,
    );

    let upstream = Arc::new(MockUpstream::new());
    let ctx = RequestContext::new("lookup");

    let upstream_ref = Arc::clone(&upstream);
    let result = executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert_eq!(result.unwrap(), "ok");
    assert!(logs_contain("usage accounting skipped"));
}

#[tokio::test]
async fn test_retries_transient_failures_then_succeeds() {
    let stack = stack(10, fast_table(5), Duration::from_secs(1));
    let upstream = Arc::new(MockUpstream::failing_times(2, server_error()));
    let ctx = RequestContext::new("generate");

    let upstream_ref = Arc::clone(&upstream);
    let result = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert!(result.is_ok());
    assert_eq!(upstream.calls(), 3);

    // Every attempt was recorded, not just the admission
    let usage = stack.monitoring.get_metrics("llm").unwrap();
    assert_eq!(usage.total_requests, 3);
    assert_eq!(usage.failed_requests, 2);

    let record = stack.health.record().await;
    assert_eq!(record.status, HealthStatus::Healthy);
    assert_eq!(record.consecutive_successes, 1);
}

#[tokio::test]
async fn test_auth_failure_short_circuits_retries() {
    let stack = stack(10, fast_table(5), Duration::from_secs(1));
    let upstream = Arc::new(MockUpstream::failing_times(5, auth_error()));
    let ctx = RequestContext::new("generate");

    let upstream_ref = Arc::clone(&upstream);
    let result: Result<String, _> = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    // Exactly one attempt regardless of the configured max_retries
    assert_eq!(upstream.calls(), 1);
    match result {
        Err(GuardError::Upstream(UpstreamError::Auth { status, .. })) => assert_eq!(status, 401),
        other => panic!("expected auth error, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_exhausted_retries_return_last_error() {
    let stack = stack(10, fast_table(3), Duration::from_secs(1));
    let upstream = Arc::new(MockUpstream::failing_times(10, server_error()));
    let ctx = RequestContext::new("generate");

    let upstream_ref = Arc::clone(&upstream);
    let result: Result<String, _> = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert_eq!(upstream.calls(), 3);
    match result {
        Err(GuardError::RetriesExhausted {
            attempts,
            source: UpstreamError::Server { status, .. },
            ..
        }) => {
            assert_eq!(attempts, 3);
            assert_eq!(status, 500);
        }
        other => panic!("expected retries exhausted, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_breaker_opening_mid_run_stops_remaining_attempts() {
    // Threshold 2 with 5 configured attempts: the circuit opens after the
    // second failure and the run ends with a circuit-open rejection
    let stack = stack(2, fast_table(5), Duration::from_secs(1));
    let upstream = Arc::new(MockUpstream::failing_times(10, server_error()));
    let ctx = RequestContext::new("generate");

    let upstream_ref = Arc::clone(&upstream);
    let result: Result<String, _> = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert_eq!(upstream.calls(), 2);
    assert!(matches!(result, Err(GuardError::CircuitOpen { .. })));
    assert_eq!(stack.breaker.state().await, CircuitState::Open);

    // The breaker opened during this run, so the record shows Unavailable
    let record = stack.health.record().await;
    assert_eq!(record.status, HealthStatus::Unavailable);
}

#[tokio::test]
async fn test_slow_operation_is_classified_as_timeout() {
    let stack = stack(10, fast_table(2), Duration::from_millis(50));
    let upstream = Arc::new(MockUpstream::new().with_delay(Duration::from_millis(200)));
    let ctx = RequestContext::new("generate");

    let upstream_ref = Arc::clone(&upstream);
    let result: Result<String, _> = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert_eq!(upstream.calls(), 2);
    match result {
        Err(GuardError::RetriesExhausted {
            source: UpstreamError::Timeout { .. },
            ..
        }) => {}
        other => panic!("expected timeout, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_policy_is_reselected_from_current_error_class() {
    // Server errors allow 5 attempts but rate limits only 2; when the
    // second attempt hits a 429 the tighter policy ends the run
    let table = RetryPolicyTable::default()
        .with_policy(ErrorClass::ServerError, fast_policy(5))
        .with_policy(ErrorClass::RateLimit, fast_policy(2));
    let stack = stack(10, table, Duration::from_secs(1));

    let upstream = Arc::new(MockUpstream::new());
    upstream.push(Err(server_error()));
    upstream.push(Err(UpstreamError::RateLimited { retry_after: None }));
    let ctx = RequestContext::new("generate");

    let upstream_ref = Arc::clone(&upstream);
    let result: Result<String, _> = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert_eq!(upstream.calls(), 2);
    match result {
        Err(GuardError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 2),
        other => panic!("expected retries exhausted, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_cancellation_skips_breaker_and_tags_metric() {
    let stack = stack(5, fast_table(3), Duration::from_secs(1));
    let upstream = Arc::new(MockUpstream::new().with_delay(Duration::from_millis(200)));
    let ctx = RequestContext::with_deadline("generate", Duration::from_millis(50));

    let upstream_ref = Arc::clone(&upstream);
    let result: Result<String, _> = stack
        .executor
        .execute(&ctx, || {
            let upstream = Arc::clone(&upstream_ref);
            async move { upstream.call().await }
        })
        .await;

    assert!(matches!(result, Err(GuardError::Cancelled { .. })));

    // Neither a success nor a failure for the breaker
    let info = stack.breaker.info().await;
    assert_eq!(info.consecutive_failures, 0);
    assert_eq!(info.state, CircuitState::Closed);

    // But the metric stream carries a tagged, unsuccessful point
    let points = stack.metrics.get_recent(&MetricsFilter {
        metric_type: Some(MetricType::Request),
        ..MetricsFilter::default()
    });
    let last = points.last().expect("a request point");
    assert!(!last.success);
    assert_eq!(last.extra.get("cancelled").map(String::as_str), Some("true"));
}

// src/retry.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, warn};

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::config::duration_serde;
use crate::context::RequestContext;
use crate::error::{ErrorClass, GuardError, Result, UpstreamError};
use crate::health::HealthMonitor;
use crate::metrics::{MetricPoint, MetricsCollector};
use crate::monitoring::MonitoringService;

/// Backoff parameters for one error class. Immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts for this class (the first call counts as one)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Delay before the second attempt
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Factor by which the delay grows per attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Symmetric jitter as a fraction of the computed delay
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,

    /// Ceiling for the computed delay, jitter included
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,
}

fn default_max_retries() -> usize {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.1
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_fraction: default_jitter_fraction(),
            max_delay: default_max_delay(),
        }
    }
}

/// Per-error-class retry policies with a `default` fallback entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryPolicyTable(HashMap<ErrorClass, RetryPolicy>);

impl RetryPolicyTable {
    /// The policy for an error class, falling back to the `default` entry
    /// and then to [`RetryPolicy::default`]
    pub fn policy_for(&self, class: ErrorClass) -> RetryPolicy {
        self.0
            .get(&class)
            .or_else(|| self.0.get(&ErrorClass::Default))
            .cloned()
            .unwrap_or_default()
    }

    pub fn with_policy(mut self, class: ErrorClass, policy: RetryPolicy) -> Self {
        self.0.insert(class, policy);
        self
    }
}

/// Exponential backoff delay for a zero-based attempt index.
///
/// `base_delay × backoff_multiplier^attempt`, capped at `max_delay`, then
/// jittered uniformly within ±`jitter_fraction` of the capped value. The
/// result never goes below zero or above `max_delay`.
pub fn compute_delay(policy: &RetryPolicy, attempt: usize) -> Duration {
    let max = policy.max_delay.as_secs_f64();
    let base = policy.base_delay.as_secs_f64() * policy.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(max);

    let jittered = if policy.jitter_fraction > 0.0 {
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * policy.jitter_fraction;
        capped * (1.0 + offset)
    } else {
        capped
    };

    Duration::from_secs_f64(jittered.clamp(0.0, max))
}

/// Drives bounded retry attempts of one dependency's operations, feeding
/// every outcome into the circuit breaker, health record, metrics buffer
/// and monitoring service.
///
/// The policy is re-selected on every attempt from the *current* error's
/// class, so a run that starts with a timeout and then sees a 429 switches
/// to the rate-limit backoff mid-run.
pub struct RetryExecutor {
    dependency: String,
    policies: RetryPolicyTable,
    /// Per-attempt operation timeout
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
    health: Arc<HealthMonitor>,
    metrics: Arc<MetricsCollector>,
    monitoring: Arc<MonitoringService>,
}

impl RetryExecutor {
    pub fn new(
        dependency: impl Into<String>,
        policies: RetryPolicyTable,
        timeout: Duration,
        breaker: Arc<CircuitBreaker>,
        health: Arc<HealthMonitor>,
        metrics: Arc<MetricsCollector>,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        Self {
            dependency: dependency.into(),
            policies,
            timeout,
            breaker,
            health,
            metrics,
            monitoring,
        }
    }

    /// Run `operation` with adaptive retries.
    ///
    /// The first attempt was already admitted by the caller; every retry
    /// re-checks the breaker so a circuit that opened mid-run stops the
    /// remaining attempts. Authentication failures propagate after exactly
    /// one attempt. A caller deadline cancels the attempt and the loop
    /// without touching breaker counters.
    pub async fn execute<T, F, Fut>(&self, ctx: &RequestContext, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let mut attempt: usize = 0;

        loop {
            if attempt > 0 && !self.breaker.can_execute().await {
                let retry_after = self.breaker.retry_after().await.unwrap_or_default();
                warn!(
                    dependency = %self.dependency,
                    correlation_id = %ctx.correlation_id,
                    "circuit opened during retry run, abandoning remaining attempts"
                );
                return Err(GuardError::CircuitOpen {
                    dependency: self.dependency.clone(),
                    retry_after,
                });
            }

            if ctx.is_cancelled() {
                return Err(self.cancelled(ctx, 0.0).await);
            }

            // Bound the attempt by the dependency timeout, tightened to the
            // caller's remaining budget when that is shorter.
            let (bound, deadline_bound) = match ctx.remaining() {
                Some(remaining) if remaining < self.timeout => (remaining, true),
                _ => (self.timeout, false),
            };

            let started = Instant::now();
            let outcome = time::timeout(bound, operation()).await;
            let elapsed = started.elapsed();
            let elapsed_ms = elapsed.as_millis() as f64;

            let err = match outcome {
                Ok(Ok(value)) => {
                    if let Some(transition) = self.breaker.record_success().await {
                        self.monitoring
                            .record_circuit_transition(&self.dependency, transition);
                    }
                    self.health.record_success(elapsed).await;
                    self.metrics.add_metric(
                        MetricPoint::request(&self.dependency, elapsed_ms, true)
                            .with_extra("operation", &ctx.operation)
                            .with_extra("correlation_id", ctx.correlation_id.to_string()),
                    );
                    if let Err(err) = self.monitoring.record_request(
                        &self.dependency,
                        &ctx.operation,
                        true,
                        elapsed_ms,
                        None,
                    ) {
                        warn!(
                            dependency = %self.dependency,
                            error = %err,
                            "usage accounting skipped"
                        );
                    }
                    crate::guarded_call_event!(
                        self.dependency.as_str(),
                        ctx.operation.as_str(),
                        true,
                        elapsed_ms,
                        ctx.correlation_id
                    );

                    if attempt > 0 {
                        debug!(
                            dependency = %self.dependency,
                            correlation_id = %ctx.correlation_id,
                            attempts = attempt + 1,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) if deadline_bound => {
                    return Err(self.cancelled(ctx, elapsed_ms).await);
                }
                Err(_) => UpstreamError::Timeout { elapsed: bound },
            };

            // Failure path: feed every collector before deciding on a retry
            if let Some(transition) = self.breaker.record_failure().await {
                self.monitoring
                    .record_circuit_transition(&self.dependency, transition);
            }
            let breaker_open = self.breaker.state().await == CircuitState::Open;
            self.health.record_failure(&err, breaker_open).await;
            self.metrics.add_metric(
                MetricPoint::request(&self.dependency, elapsed_ms, false)
                    .with_extra("operation", &ctx.operation)
                    .with_extra("correlation_id", ctx.correlation_id.to_string())
                    .with_extra("error_class", format!("{:?}", err.class())),
            );
            if let Err(record_err) = self.monitoring.record_request(
                &self.dependency,
                &ctx.operation,
                false,
                elapsed_ms,
                Some(&err),
            ) {
                warn!(
                    dependency = %self.dependency,
                    error = %record_err,
                    "usage accounting skipped"
                );
            }
            crate::guarded_call_event!(
                self.dependency.as_str(),
                ctx.operation.as_str(),
                false,
                elapsed_ms,
                ctx.correlation_id
            );

            if !err.is_retryable() {
                warn!(
                    dependency = %self.dependency,
                    correlation_id = %ctx.correlation_id,
                    error = %err,
                    "non-retryable failure, propagating immediately"
                );
                return Err(GuardError::Upstream(err));
            }

            let class = err.class();
            let policy = self.policies.policy_for(class);
            attempt += 1;

            if attempt >= policy.max_retries {
                warn!(
                    dependency = %self.dependency,
                    correlation_id = %ctx.correlation_id,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                return Err(GuardError::RetriesExhausted {
                    dependency: self.dependency.clone(),
                    attempts: attempt,
                    source: err,
                });
            }

            let delay = compute_delay(&policy, attempt - 1);
            debug!(
                dependency = %self.dependency,
                correlation_id = %ctx.correlation_id,
                attempt,
                error_class = ?class,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, backing off"
            );

            // Never sleep past the caller's deadline; the next iteration
            // observes the cancellation.
            let sleep_for = match ctx.remaining() {
                Some(remaining) if remaining < delay => remaining,
                _ => delay,
            };
            time::sleep(sleep_for).await;
        }
    }

    // A cancelled attempt is neither success nor failure for the breaker,
    // but the admission consumed a half-open trial slot that must be
    // given back or the breaker wedges.
    async fn cancelled(&self, ctx: &RequestContext, elapsed_ms: f64) -> GuardError {
        self.breaker.release_trial().await;
        debug!(
            dependency = %self.dependency,
            correlation_id = %ctx.correlation_id,
            "caller deadline expired, cancelling retry run"
        );
        self.metrics.add_metric(
            MetricPoint::request(&self.dependency, elapsed_ms, false)
                .with_extra("operation", &ctx.operation)
                .with_extra("correlation_id", ctx.correlation_id.to_string())
                .with_extra("cancelled", "true"),
        );
        GuardError::Cancelled {
            dependency: self.dependency.clone(),
        }
    }
}

// src/guard.rs

use chrono::{DateTime, Utc};
use futures::future;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerInfo};
use crate::config::GuardConfig;
use crate::context::RequestContext;
use crate::error::{GuardError, Result, UpstreamError};
use crate::health::{HealthMonitor, HealthProbe, HealthRecord};
use crate::metrics::{MetricPoint, MetricType, MetricsCollector, MetricsFilter};
use crate::monitoring::{AlertEvent, AlertHandler, MonitoringService, UsageMetrics};
use crate::rate_window::RateLimiter;
use crate::retry::RetryExecutor;

// Everything the facade composes for one named dependency
struct DependencyHandle {
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    health: Arc<HealthMonitor>,
    executor: RetryExecutor,
}

/// Per-dependency health records, one snapshot
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub generated_at: DateTime<Utc>,
    pub dependencies: HashMap<String, HealthRecord>,
}

/// One dependency's slice of the operator dashboard
#[derive(Debug, Clone, Serialize)]
pub struct DependencyDashboard {
    pub health: HealthRecord,
    pub usage: UsageMetrics,
    pub circuit: CircuitBreakerInfo,
}

/// Operator snapshot composing recent metrics, per-dependency health and
/// usage, breaker states, and recent alerts
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringDashboard {
    pub generated_at: DateTime<Utc>,
    pub dependencies: HashMap<String, DependencyDashboard>,
    pub recent_metrics: Vec<MetricPoint>,
    pub recent_alerts: Vec<AlertEvent>,
}

/// The single entry point callers use to reach upstream dependencies.
///
/// Composes a circuit breaker, rate-limit windows, a health monitor and a
/// retry executor per configured dependency, plus a shared metrics buffer
/// and monitoring service. Constructed explicitly from configuration and
/// injected into collaborators; there is no ambient global instance.
pub struct UpstreamGuard {
    dependencies: HashMap<String, Arc<DependencyHandle>>,
    metrics: Arc<MetricsCollector>,
    monitoring: Arc<MonitoringService>,
}

impl UpstreamGuard {
    pub fn new(config: GuardConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new(
            config.metrics_capacity,
            config.subscriber_queue_size,
        ));
        let monitoring = Arc::new(MonitoringService::new(
            config.response_sample_size,
            config.alert_history_size,
        ));

        let mut dependencies = HashMap::new();
        for (name, dep_config) in config.dependencies {
            monitoring.register_dependency(&name, dep_config.alert_thresholds.clone());

            let breaker = Arc::new(CircuitBreaker::new(&name, dep_config.circuit_breaker()));
            let health = Arc::new(HealthMonitor::new(
                &name,
                dep_config.health_probe.clone(),
                Arc::clone(&metrics),
                Arc::clone(&monitoring),
            ));
            let executor = RetryExecutor::new(
                &name,
                dep_config.retry_policies.clone(),
                dep_config.timeout,
                Arc::clone(&breaker),
                Arc::clone(&health),
                Arc::clone(&metrics),
                Arc::clone(&monitoring),
            );
            let limiter = RateLimiter::new(&name, dep_config.rate_limits.clone());

            info!(dependency = %name, "dependency registered");
            dependencies.insert(
                name,
                Arc::new(DependencyHandle {
                    breaker,
                    limiter,
                    health,
                    executor,
                }),
            );
        }

        Self {
            dependencies,
            metrics,
            monitoring,
        }
    }

    fn handle(&self, name: &str) -> Result<&Arc<DependencyHandle>> {
        self.dependencies
            .get(name)
            .ok_or_else(|| GuardError::UnknownDependency(name.to_string()))
    }

    /// Execute an operation against a named dependency.
    ///
    /// Order per call: circuit-breaker admission, then rate-limit windows,
    /// then one admission recorded against every window, then the retry
    /// executor. Rejections return without invoking the operation and use
    /// error kinds distinct from execution failures.
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &str,
        ctx: &RequestContext,
        operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, UpstreamError>>,
    {
        let handle = self.handle(dependency)?;

        if !handle.breaker.can_execute().await {
            let retry_after = handle.breaker.retry_after().await.unwrap_or_default();
            warn!(
                dependency,
                correlation_id = %ctx.correlation_id,
                operation = %ctx.operation,
                retry_after_ms = retry_after.as_millis() as u64,
                "call rejected: circuit open"
            );
            self.metrics.add_metric(
                MetricPoint::new(dependency, MetricType::Error, 0.0)
                    .with_success(false)
                    .with_extra("rejection", "circuit_open")
                    .with_extra("correlation_id", ctx.correlation_id.to_string()),
            );
            return Err(GuardError::CircuitOpen {
                dependency: dependency.to_string(),
                retry_after,
            });
        }

        if let Some(reset_after) = handle.limiter.check_limited().await {
            // The breaker already admitted this call; give the trial slot
            // back so a rate-limited rejection cannot exhaust half-open.
            handle.breaker.release_trial().await;
            debug!(
                dependency,
                correlation_id = %ctx.correlation_id,
                operation = %ctx.operation,
                reset_after_ms = reset_after.as_millis() as u64,
                "call rejected: rate limited"
            );
            self.metrics.add_metric(
                MetricPoint::new(dependency, MetricType::Error, 0.0)
                    .with_success(false)
                    .with_extra("rejection", "rate_limited")
                    .with_extra("correlation_id", ctx.correlation_id.to_string()),
            );
            return Err(GuardError::RateLimited {
                dependency: dependency.to_string(),
                reset_after,
            });
        }

        // One admission, regardless of how many retry attempts follow
        handle.limiter.record_request().await;

        handle.executor.execute(ctx, operation).await
    }

    /// Install the health probe for a dependency
    pub fn register_probe(&self, dependency: &str, probe: Arc<dyn HealthProbe>) -> Result<()> {
        self.handle(dependency)?.health.set_probe(probe);
        Ok(())
    }

    /// Run (or read the cached) health check for one dependency
    pub async fn check_health(&self, dependency: &str, force: bool) -> Result<HealthRecord> {
        Ok(self.handle(dependency)?.health.check_health(force).await)
    }

    /// Administrative: force a breaker back to closed
    pub async fn reset_circuit_breaker(&self, dependency: &str) -> Result<()> {
        let handle = self.handle(dependency)?;
        if let Some(transition) = handle.breaker.reset().await {
            self.monitoring
                .record_circuit_transition(dependency, transition);
        }
        Ok(())
    }

    /// Current breaker snapshot for one dependency
    pub async fn circuit_breaker_info(&self, dependency: &str) -> Result<CircuitBreakerInfo> {
        Ok(self.handle(dependency)?.breaker.info().await)
    }

    /// Health records for every dependency, using cached verdicts where
    /// still fresh
    pub async fn get_health_summary(&self) -> HealthSummary {
        let checks = self.dependencies.iter().map(|(name, handle)| async move {
            (name.clone(), handle.health.check_health(false).await)
        });
        HealthSummary {
            generated_at: Utc::now(),
            dependencies: future::join_all(checks).await.into_iter().collect(),
        }
    }

    /// One operator snapshot: recent metrics, per-dependency health,
    /// usage and breaker state, and recent alerts
    pub async fn get_monitoring_dashboard(&self) -> MonitoringDashboard {
        let mut usage = self.monitoring.all_metrics();
        let mut dependencies = HashMap::new();

        for (name, handle) in &self.dependencies {
            let health = handle.health.record().await;
            let circuit = handle.breaker.info().await;
            let usage = usage.remove(name).unwrap_or_else(|| {
                // Registered at construction, so this only covers a
                // dependency added to the map without registration
                UsageMetrics {
                    total_requests: 0,
                    successful_requests: 0,
                    failed_requests: 0,
                    avg_response_time_ms: None,
                    requests_24h: 0,
                    failures_24h: 0,
                    uptime_percentage: 100.0,
                    downtime_started: None,
                    total_downtime_minutes: 0.0,
                }
            });
            dependencies.insert(
                name.clone(),
                DependencyDashboard {
                    health,
                    usage,
                    circuit,
                },
            );
        }

        MonitoringDashboard {
            generated_at: Utc::now(),
            dependencies,
            recent_metrics: self.metrics.get_recent(&MetricsFilter {
                limit: Some(50),
                ..MetricsFilter::default()
            }),
            recent_alerts: self.monitoring.recent_alerts(20),
        }
    }

    /// Usage aggregates for one dependency
    pub fn get_usage_metrics(&self, dependency: &str) -> Result<UsageMetrics> {
        self.monitoring.get_metrics(dependency)
    }

    /// Subscribe to the live metrics stream
    pub fn subscribe_metrics(&self) -> (Uuid, tokio::sync::mpsc::Receiver<MetricPoint>) {
        self.metrics.subscribe()
    }

    /// Drop a live metrics subscription
    pub fn unsubscribe_metrics(&self, id: Uuid) {
        self.metrics.unsubscribe(id);
    }

    /// Register an alert observer; returns an id for removal
    pub fn register_alert_callback(&self, handler: Arc<dyn AlertHandler>) -> Uuid {
        self.monitoring.register_alert_callback(handler)
    }

    /// Remove an alert observer
    pub fn unregister_alert_callback(&self, id: Uuid) {
        self.monitoring.unregister_alert_callback(id);
    }

    /// Spawn the background probing task of every dependency
    pub fn start_health_probes(&self) -> Vec<task::JoinHandle<()>> {
        self.dependencies
            .values()
            .map(|handle| handle.health.start())
            .collect()
    }

    /// Signal every background probing task to stop
    pub fn stop_health_probes(&self) {
        for handle in self.dependencies.values() {
            handle.health.stop();
        }
    }

    /// Shared metrics collector, for collaborators that read or summarize
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Shared monitoring service
    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.monitoring
    }
}

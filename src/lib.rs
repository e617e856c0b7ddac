// library entry
//! Resilience layer mediating calls to unreliable upstream dependencies.
//!
//! Per named dependency this crate composes:
//!
//! 1. **Circuit Breaking** - Fail fast while a dependency is unhealthy
//! 2. **Rate-Limit Windows** - Enforce one or more usage quotas
//! 3. **Retry with Exponential Backoff** - Adaptive, error-class-driven retries
//! 4. **Health Probing** - Cheap cached availability checks
//! 5. **Metrics & Alerting** - Bounded metric buffer with live fan-out and
//!    threshold-based alerts
//!
//! Callers construct an [`UpstreamGuard`] from a [`GuardConfig`] and route
//! every upstream call through [`UpstreamGuard::execute`].

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod monitoring;
pub mod rate_window;
pub mod retry;

#[cfg(test)]
pub(crate) mod test_utils;
#[cfg(test)]
mod tests;

// Re-export key components for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerInfo, CircuitState, CircuitTransition,
};
pub use config::{DependencyConfig, GuardConfig};
pub use context::RequestContext;
pub use error::{ErrorClass, GuardError, Result, UpstreamError};
pub use guard::{DependencyDashboard, HealthSummary, MonitoringDashboard, UpstreamGuard};
pub use health::{HealthMonitor, HealthProbe, HealthProbeConfig, HealthRecord, HealthStatus};
pub use logging::init as init_logging;
pub use metrics::{
    DependencySummary, MetricPoint, MetricType, MetricsCollector, MetricsFilter, MetricsSummary,
};
pub use monitoring::{
    AlertEvent, AlertHandler, AlertSeverity, AlertThresholds, MonitoringService, UsageMetrics,
};
pub use rate_window::{RateLimitConfig, RateLimitWindow, RateLimiter};
pub use retry::{compute_delay, RetryExecutor, RetryPolicy, RetryPolicyTable};

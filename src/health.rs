// src/health.rs

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task;
use tokio::time;
use tracing::{debug, error, info};

use crate::config::duration_serde;
use crate::error::UpstreamError;
use crate::metrics::{MetricPoint, MetricsCollector};
use crate::monitoring::MonitoringService;

/// Point-in-time health verdict for a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unavailable,
    RateLimited,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unavailable => "unavailable",
            HealthStatus::RateLimited => "rate_limited",
            HealthStatus::Unknown => "unknown",
        }
    }
}

/// Health state of one dependency.
///
/// Updated by probe runs and by outcome classification after real
/// operation calls; both paths feed this one record.
#[derive(Debug, Clone, Serialize)]
pub struct HealthRecord {
    pub status: HealthStatus,
    /// When the probe last actually ran (drives freshness caching)
    pub last_check: Option<DateTime<Utc>>,
    #[serde(with = "duration_serde::option")]
    pub response_time: Option<Duration>,
    pub error_message: Option<String>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_success: Option<DateTime<Utc>>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            response_time: None,
            error_message: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success: None,
        }
    }
}

/// A cheap, idempotent check against one dependency.
///
/// Returns `Ok(true)` when the probe call succeeded AND its success
/// predicate held (e.g. "response parses and contains at least one
/// element"), `Ok(false)` when the call succeeded but the predicate did
/// not, and `Err` for transport-level failures.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<bool, UpstreamError>;
}

/// Probe timing and freshness configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthProbeConfig {
    /// Timeout for one probe execution
    #[serde(default = "default_probe_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Cached verdicts younger than this are returned without re-probing
    #[serde(default = "default_freshness_window", with = "duration_serde")]
    pub freshness_window: Duration,

    /// A successful probe slower than this is reported Degraded
    #[serde(default = "default_degraded_after", with = "duration_serde")]
    pub degraded_after: Duration,

    /// Interval for the optional background probing task
    #[serde(default = "default_check_interval", with = "duration_serde")]
    pub check_interval: Duration,
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_freshness_window() -> Duration {
    Duration::from_secs(300)
}

fn default_degraded_after() -> Duration {
    Duration::from_secs(2)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

impl Default for HealthProbeConfig {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
            freshness_window: default_freshness_window(),
            degraded_after: default_degraded_after(),
            check_interval: default_check_interval(),
        }
    }
}

/// Owns the health record of one dependency and runs its probe.
pub struct HealthMonitor {
    name: String,
    config: HealthProbeConfig,
    probe: RwLock<Option<Arc<dyn HealthProbe>>>,
    record: Mutex<HealthRecord>,
    metrics: Arc<MetricsCollector>,
    monitoring: Arc<MonitoringService>,
    probe_in_flight: AtomicBool,
    cancel_flag: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(
        name: impl Into<String>,
        config: HealthProbeConfig,
        metrics: Arc<MetricsCollector>,
        monitoring: Arc<MonitoringService>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            probe: RwLock::new(None),
            record: Mutex::new(HealthRecord::default()),
            metrics,
            monitoring,
            probe_in_flight: AtomicBool::new(false),
            cancel_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Install or replace the probe used for this dependency
    pub fn set_probe(&self, probe: Arc<dyn HealthProbe>) {
        *self.probe.write().unwrap() = Some(probe);
    }

    /// Snapshot the current record without probing
    pub async fn record(&self) -> HealthRecord {
        self.record.lock().await.clone()
    }

    /// Return the health verdict, probing only when the cached record is
    /// older than the freshness window or `force` is set.
    pub async fn check_health(&self, force: bool) -> HealthRecord {
        if !force {
            let record = self.record.lock().await;
            if let Some(last_check) = record.last_check {
                let max_age = ChronoDuration::from_std(self.config.freshness_window)
                    .unwrap_or_else(|_| ChronoDuration::seconds(300));
                if Utc::now() - last_check < max_age {
                    return record.clone();
                }
            }
        }

        // Without a probe the record still reflects real-traffic outcomes;
        // return it as-is rather than degrading it to Unknown.
        let probe = self.probe.read().unwrap().clone();
        let Some(probe) = probe else {
            return self.record.lock().await.clone();
        };

        // Collapse concurrent checks: while a probe is already running,
        // unforced callers get the current record instead of a second probe
        if self.probe_in_flight.swap(true, Ordering::SeqCst) && !force {
            return self.record.lock().await.clone();
        }

        let started = Instant::now();
        let outcome = time::timeout(self.config.timeout, probe.probe()).await;
        let elapsed = started.elapsed();

        let (status, error_message) = match outcome {
            Ok(Ok(true)) if elapsed >= self.config.degraded_after => (
                HealthStatus::Degraded,
                Some(format!("slow response: {}ms", elapsed.as_millis())),
            ),
            Ok(Ok(true)) => (HealthStatus::Healthy, None),
            Ok(Ok(false)) => (
                HealthStatus::Degraded,
                Some("probe success predicate failed".to_string()),
            ),
            Ok(Err(UpstreamError::RateLimited { .. })) => (
                HealthStatus::RateLimited,
                Some("rate limited by upstream".to_string()),
            ),
            Ok(Err(err @ UpstreamError::Auth { .. }))
            | Ok(Err(err @ UpstreamError::Connection(_))) => {
                (HealthStatus::Unavailable, Some(err.to_string()))
            }
            Ok(Err(UpstreamError::Timeout { .. })) => {
                (HealthStatus::Degraded, Some("timeout".to_string()))
            }
            Ok(Err(err)) => (HealthStatus::Degraded, Some(err.to_string())),
            Err(_) => (HealthStatus::Degraded, Some("timeout".to_string())),
        };

        let healthy = status == HealthStatus::Healthy;
        if !healthy {
            error!(
                dependency = %self.name,
                status = status.as_str(),
                error = error_message.as_deref().unwrap_or(""),
                "health check failed"
            );
        }

        let snapshot = {
            let mut record = self.record.lock().await;
            record.status = status;
            record.last_check = Some(Utc::now());
            record.response_time = Some(elapsed);
            record.error_message = error_message;
            if healthy {
                record.consecutive_successes += 1;
                record.consecutive_failures = 0;
                record.last_success = Some(Utc::now());
            } else {
                record.consecutive_failures += 1;
                record.consecutive_successes = 0;
            }
            record.clone()
        };
        self.probe_in_flight.store(false, Ordering::SeqCst);

        self.metrics.add_metric(
            MetricPoint::health_check(&self.name, elapsed.as_millis() as f64, healthy)
                .with_extra("status", status.as_str()),
        );
        self.monitoring.record_health_check(&self.name, &snapshot);

        snapshot
    }

    /// Feed a successful real-traffic call into the record
    pub async fn record_success(&self, response_time: Duration) {
        let snapshot = {
            let mut record = self.record.lock().await;
            record.status = HealthStatus::Healthy;
            record.response_time = Some(response_time);
            record.error_message = None;
            record.consecutive_successes += 1;
            record.consecutive_failures = 0;
            record.last_success = Some(Utc::now());
            record.clone()
        };
        self.monitoring.record_health_check(&self.name, &snapshot);
    }

    /// Feed a failed real-traffic call into the record. `breaker_open`
    /// marks the dependency Unavailable instead of Degraded.
    pub async fn record_failure(&self, error: &UpstreamError, breaker_open: bool) {
        let status = if breaker_open {
            HealthStatus::Unavailable
        } else if matches!(error, UpstreamError::RateLimited { .. }) {
            HealthStatus::RateLimited
        } else {
            HealthStatus::Degraded
        };

        let snapshot = {
            let mut record = self.record.lock().await;
            record.status = status;
            record.error_message = Some(error.to_string());
            record.consecutive_failures += 1;
            record.consecutive_successes = 0;
            record.clone()
        };
        self.monitoring.record_health_check(&self.name, &snapshot);
    }

    /// Start the background probing task
    pub fn start(self: &Arc<Self>) -> task::JoinHandle<()> {
        let monitor = Arc::clone(self);
        let interval = monitor.config.check_interval;
        let cancel_flag = Arc::clone(&monitor.cancel_flag);
        cancel_flag.store(false, Ordering::SeqCst);

        task::spawn(async move {
            let mut interval_timer = time::interval(interval);
            // Skip the immediate first tick so startup is quiet
            interval_timer.tick().await;

            loop {
                interval_timer.tick().await;

                if cancel_flag.load(Ordering::SeqCst) {
                    break;
                }

                let record = monitor.check_health(true).await;
                if record.status == HealthStatus::Healthy {
                    info!(dependency = %monitor.name, "background health check passed");
                }
            }

            debug!(dependency = %monitor.name, "health probe task stopped");
        })
    }

    /// Stop the background probing task
    pub fn stop(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }
}

// src/monitoring.rs

// Aggregates request outcomes and health checks into per-dependency usage
// statistics and raises threshold-based alerts to registered observers.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CircuitState, CircuitTransition};
use crate::error::{GuardError, Result, UpstreamError};
use crate::health::{HealthRecord, HealthStatus};

// Upper bound on the 24h request-history ring, independent of traffic rate
const HISTORY_CAP: usize = 100_000;

/// Severity attached to an alert event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Error,
}

/// One threshold breach or notable state change
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub timestamp: DateTime<Utc>,
    pub alert_type: String,
    pub dependency: String,
    pub message: String,
    pub severity: AlertSeverity,
}

impl AlertEvent {
    fn new(
        alert_type: &str,
        dependency: &str,
        message: String,
        severity: AlertSeverity,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            alert_type: alert_type.to_string(),
            dependency: dependency.to_string(),
            message,
            severity,
        }
    }
}

/// Typed observer invoked for every alert event.
///
/// Registration and removal are thread-safe; dispatch iterates a snapshot
/// of the handler table, so handlers may themselves register or remove
/// handlers without deadlocking.
pub trait AlertHandler: Send + Sync {
    fn on_alert(&self, event: &AlertEvent);
}

/// Thresholds evaluated after each recorded request / health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Rolling average response time above this raises a warning
    #[serde(default = "default_response_time_ms")]
    pub response_time_ms: f64,

    /// Failure fraction above this raises an error
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// Minimum rolling samples before the failure rate is evaluated
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Continuous downtime beyond this many minutes raises an error
    #[serde(default = "default_downtime_minutes")]
    pub downtime_minutes: f64,
}

fn default_response_time_ms() -> f64 {
    5000.0
}

fn default_failure_rate() -> f64 {
    0.5
}

fn default_min_samples() -> usize {
    10
}

fn default_downtime_minutes() -> f64 {
    5.0
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            response_time_ms: default_response_time_ms(),
            failure_rate: default_failure_rate(),
            min_samples: default_min_samples(),
            downtime_minutes: default_downtime_minutes(),
        }
    }
}

/// Per-dependency usage aggregates, derived on demand
#[derive(Debug, Clone, Serialize)]
pub struct UsageMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time_ms: Option<f64>,
    pub requests_24h: u64,
    pub failures_24h: u64,
    /// Successful / total, as a percentage; 100 when no traffic yet
    pub uptime_percentage: f64,
    pub downtime_started: Option<DateTime<Utc>>,
    pub total_downtime_minutes: f64,
}

struct DependencyStats {
    thresholds: AlertThresholds,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    /// Rolling window of (response_time_ms, success), newest last
    recent: VecDeque<(f64, bool)>,
    /// Request history for 24h counters, trimmed by age on insert
    history: VecDeque<(DateTime<Utc>, bool)>,
    downtime_started: Option<DateTime<Utc>>,
    total_downtime_minutes: f64,
}

impl DependencyStats {
    fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            recent: VecDeque::new(),
            history: VecDeque::new(),
            downtime_started: None,
            total_downtime_minutes: 0.0,
        }
    }

    fn avg_response_time(&self) -> Option<f64> {
        if self.recent.is_empty() {
            return None;
        }
        let sum: f64 = self.recent.iter().map(|(ms, _)| ms).sum();
        Some(sum / self.recent.len() as f64)
    }

    fn rolling_failure_rate(&self) -> f64 {
        if self.recent.is_empty() {
            return 0.0;
        }
        let failures = self.recent.iter().filter(|(_, success)| !success).count();
        failures as f64 / self.recent.len() as f64
    }

    fn usage(&self) -> UsageMetrics {
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        let requests_24h = self.history.iter().filter(|(at, _)| *at >= cutoff).count() as u64;
        let failures_24h = self
            .history
            .iter()
            .filter(|(at, success)| *at >= cutoff && !success)
            .count() as u64;

        UsageMetrics {
            total_requests: self.total_requests,
            successful_requests: self.successful_requests,
            failed_requests: self.failed_requests,
            avg_response_time_ms: self.avg_response_time(),
            requests_24h,
            failures_24h,
            uptime_percentage: if self.total_requests == 0 {
                100.0
            } else {
                self.successful_requests as f64 / self.total_requests as f64 * 100.0
            },
            downtime_started: self.downtime_started,
            total_downtime_minutes: self.total_downtime_minutes,
        }
    }
}

/// Thread-safe aggregation and alerting service, shared by all
/// dependencies. Each dependency's statistics sit behind their own lock.
pub struct MonitoringService {
    sample_size: usize,
    alert_history_size: usize,
    stats: RwLock<HashMap<String, Arc<Mutex<DependencyStats>>>>,
    handlers: RwLock<Vec<(Uuid, Arc<dyn AlertHandler>)>>,
    alert_history: Mutex<VecDeque<AlertEvent>>,
}

impl MonitoringService {
    pub fn new(sample_size: usize, alert_history_size: usize) -> Self {
        Self {
            sample_size,
            alert_history_size,
            stats: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            alert_history: Mutex::new(VecDeque::new()),
        }
    }

    /// Make a dependency known to the service, with its alert thresholds
    pub fn register_dependency(&self, name: impl Into<String>, thresholds: AlertThresholds) {
        self.stats
            .write()
            .unwrap()
            .insert(name.into(), Arc::new(Mutex::new(DependencyStats::new(thresholds))));
    }

    fn dependency_stats(&self, name: &str) -> Result<Arc<Mutex<DependencyStats>>> {
        self.stats
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| GuardError::UnknownDependency(name.to_string()))
    }

    /// Record one completed operation attempt and evaluate alert rules
    pub fn record_request(
        &self,
        dependency: &str,
        operation: &str,
        success: bool,
        response_time_ms: f64,
        error: Option<&UpstreamError>,
    ) -> Result<()> {
        let stats = self.dependency_stats(dependency)?;
        let mut alerts = Vec::new();

        {
            let mut stats = stats.lock().unwrap();
            stats.total_requests += 1;
            if success {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
            }

            stats.recent.push_back((response_time_ms, success));
            while stats.recent.len() > self.sample_size {
                stats.recent.pop_front();
            }

            let now = Utc::now();
            stats.history.push_back((now, success));
            let cutoff = now - ChronoDuration::hours(24);
            while stats
                .history
                .front()
                .map(|(at, _)| *at < cutoff)
                .unwrap_or(false)
                || stats.history.len() > HISTORY_CAP
            {
                stats.history.pop_front();
            }

            if let Some(avg) = stats.avg_response_time() {
                if avg > stats.thresholds.response_time_ms {
                    alerts.push(AlertEvent::new(
                        "high_response_time",
                        dependency,
                        format!(
                            "average response time {:.0}ms exceeds threshold {:.0}ms",
                            avg, stats.thresholds.response_time_ms
                        ),
                        AlertSeverity::Warning,
                    ));
                }
            }

            if stats.recent.len() >= stats.thresholds.min_samples {
                let rate = stats.rolling_failure_rate();
                if rate > stats.thresholds.failure_rate {
                    alerts.push(AlertEvent::new(
                        "high_failure_rate",
                        dependency,
                        format!(
                            "failure rate {:.0}% exceeds threshold {:.0}%",
                            rate * 100.0,
                            stats.thresholds.failure_rate * 100.0
                        ),
                        AlertSeverity::Error,
                    ));
                }
            }
        }

        info!(
            dependency,
            operation,
            success,
            response_time_ms,
            error_message = error.map(|e| e.to_string()).unwrap_or_default(),
            "request recorded"
        );

        self.raise(alerts);
        Ok(())
    }

    /// Track downtime transitions from a health record update
    pub fn record_health_check(&self, dependency: &str, record: &HealthRecord) {
        let Ok(stats) = self.dependency_stats(dependency) else {
            return;
        };
        let mut alerts = Vec::new();

        {
            let mut stats = stats.lock().unwrap();
            let now = Utc::now();

            if record.status == HealthStatus::Unavailable {
                match stats.downtime_started {
                    None => {
                        stats.downtime_started = Some(now);
                        warn!(dependency, "dependency became unavailable, downtime clock started");
                    }
                    Some(started) => {
                        let minutes = (now - started).num_seconds() as f64 / 60.0;
                        if minutes > stats.thresholds.downtime_minutes {
                            alerts.push(AlertEvent::new(
                                "extended_downtime",
                                dependency,
                                format!(
                                    "unavailable for {:.1} minutes (threshold {:.1})",
                                    minutes, stats.thresholds.downtime_minutes
                                ),
                                AlertSeverity::Error,
                            ));
                        }
                    }
                }
            } else if let Some(started) = stats.downtime_started.take() {
                let minutes = (Utc::now() - started).num_seconds() as f64 / 60.0;
                stats.total_downtime_minutes += minutes;
                info!(
                    dependency,
                    downtime_minutes = minutes,
                    "dependency recovered from downtime"
                );
            }
        }

        self.raise(alerts);
    }

    /// Surface a circuit-breaker transition as an alert event
    pub fn record_circuit_transition(&self, dependency: &str, transition: CircuitTransition) {
        let severity = if transition.to == CircuitState::Open {
            AlertSeverity::Error
        } else {
            AlertSeverity::Warning
        };

        self.raise(vec![AlertEvent::new(
            "circuit_breaker",
            dependency,
            format!(
                "circuit breaker transitioned from {:?} to {:?}",
                transition.from, transition.to
            ),
            severity,
        )]);
    }

    /// Usage aggregates for one dependency
    pub fn get_metrics(&self, dependency: &str) -> Result<UsageMetrics> {
        let stats = self.dependency_stats(dependency)?;
        let stats = stats.lock().unwrap();
        Ok(stats.usage())
    }

    /// Usage aggregates for every known dependency
    pub fn all_metrics(&self) -> HashMap<String, UsageMetrics> {
        let stats = self.stats.read().unwrap();
        stats
            .iter()
            .map(|(name, stats)| (name.clone(), stats.lock().unwrap().usage()))
            .collect()
    }

    /// Register an alert observer; returns an id for removal
    pub fn register_alert_callback(&self, handler: Arc<dyn AlertHandler>) -> Uuid {
        let id = Uuid::new_v4();
        self.handlers.write().unwrap().push((id, handler));
        id
    }

    /// Remove a previously registered alert observer
    pub fn unregister_alert_callback(&self, id: Uuid) {
        self.handlers.write().unwrap().retain(|(hid, _)| *hid != id);
    }

    /// Most recent alert events, newest last
    pub fn recent_alerts(&self, limit: usize) -> Vec<AlertEvent> {
        let history = self.alert_history.lock().unwrap();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    // Append to history and dispatch to a snapshot of the handler table
    fn raise(&self, alerts: Vec<AlertEvent>) {
        if alerts.is_empty() {
            return;
        }

        {
            let mut history = self.alert_history.lock().unwrap();
            for alert in &alerts {
                if history.len() >= self.alert_history_size {
                    history.pop_front();
                }
                history.push_back(alert.clone());
            }
        }

        let handlers: Vec<Arc<dyn AlertHandler>> = self
            .handlers
            .read()
            .unwrap()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for alert in &alerts {
            warn!(
                dependency = %alert.dependency,
                alert_type = %alert.alert_type,
                severity = ?alert.severity,
                message = %alert.message,
                "alert raised"
            );
            for handler in &handlers {
                handler.on_alert(alert);
            }
        }
    }
}

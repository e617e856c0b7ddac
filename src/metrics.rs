// src/metrics.rs

// Thread-safe bounded metric pipeline: a fixed-capacity ring buffer of the
// most recent points plus non-blocking fan-out to live subscribers.
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;
use uuid::Uuid;

/// Kind of event a metric point records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Request,
    ResponseTime,
    Error,
    HealthCheck,
}

/// One ephemeral metric event. Never persisted by this layer.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub dependency: String,
    pub metric_type: MetricType,
    /// Response time in milliseconds for request/health-check points,
    /// otherwise a free-form magnitude
    pub value: f64,
    pub success: bool,
    /// Free-form tags, e.g. operation name or a "cancelled" marker
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl MetricPoint {
    pub fn new(dependency: impl Into<String>, metric_type: MetricType, value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            dependency: dependency.into(),
            metric_type,
            value,
            success: true,
            extra: HashMap::new(),
        }
    }

    /// A `request` point for one completed operation attempt
    pub fn request(dependency: impl Into<String>, response_time_ms: f64, success: bool) -> Self {
        let mut point = Self::new(dependency, MetricType::Request, response_time_ms);
        point.success = success;
        point
    }

    /// A `health_check` point for one real probe execution
    pub fn health_check(
        dependency: impl Into<String>,
        response_time_ms: f64,
        success: bool,
    ) -> Self {
        let mut point = Self::new(dependency, MetricType::HealthCheck, response_time_ms);
        point.success = success;
        point
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }
}

/// Filter for [`MetricsCollector::get_recent`]
#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub dependency: Option<String>,
    pub metric_type: Option<MetricType>,
    /// Keep only the most recent N matching points
    pub limit: Option<usize>,
}

impl MetricsFilter {
    fn matches(&self, point: &MetricPoint) -> bool {
        if let Some(dependency) = &self.dependency {
            if &point.dependency != dependency {
                return false;
            }
        }
        if let Some(metric_type) = self.metric_type {
            if point.metric_type != metric_type {
                return false;
            }
        }
        true
    }
}

/// Per-dependency aggregate within a summary window
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencySummary {
    pub count_by_type: HashMap<MetricType, u64>,
    pub requests: u64,
    pub failures: u64,
    pub avg_response_time_ms: Option<f64>,
}

/// Aggregates over a trailing time window
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub generated_at: DateTime<Utc>,
    pub window_ms: u64,
    pub total_points: usize,
    pub by_dependency: HashMap<String, DependencySummary>,
}

struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<MetricPoint>,
}

/// Bounded, thread-safe metric buffer with live fan-out.
///
/// Appends evict the oldest point on overflow. Fan-out uses `try_send`
/// into each subscriber's bounded queue; a subscriber whose queue is full
/// or whose receiver is gone is dropped so producers never block on
/// consumer behavior.
pub struct MetricsCollector {
    capacity: usize,
    subscriber_queue_size: usize,
    buffer: Mutex<VecDeque<MetricPoint>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl MetricsCollector {
    pub fn new(capacity: usize, subscriber_queue_size: usize) -> Self {
        Self {
            capacity,
            subscriber_queue_size,
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Append a point and fan it out to all live subscribers
    pub fn add_metric(&self, point: MetricPoint) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() >= self.capacity {
                buffer.pop_front();
            }
            buffer.push_back(point.clone());
        }

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|subscriber| match subscriber.tx.try_send(point.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    subscriber_id = %subscriber.id,
                    "metrics subscriber queue full, dropping subscriber"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Register a live subscriber; returns its id and the receiving end
    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<MetricPoint>) {
        let (tx, rx) = mpsc::channel(self.subscriber_queue_size);
        let id = Uuid::new_v4();
        self.subscribers
            .lock()
            .unwrap()
            .push(Subscriber { id, tx });
        (id, rx)
    }

    /// Remove a subscriber by id
    pub fn unsubscribe(&self, id: Uuid) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.id != id);
    }

    /// Number of currently registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Most recent points matching the filter, in insertion order
    pub fn get_recent(&self, filter: &MetricsFilter) -> Vec<MetricPoint> {
        let buffer = self.buffer.lock().unwrap();
        let matching: Vec<MetricPoint> = buffer
            .iter()
            .filter(|point| filter.matches(point))
            .cloned()
            .collect();

        match filter.limit {
            Some(limit) if matching.len() > limit => {
                matching[matching.len() - limit..].to_vec()
            }
            _ => matching,
        }
    }

    /// Aggregate counts and average response times within a trailing window
    pub fn summarize(&self, window: Duration) -> MetricsSummary {
        let now = Utc::now();
        let cutoff = now
            - ChronoDuration::from_std(window).unwrap_or_else(|_| ChronoDuration::seconds(0));

        let buffer = self.buffer.lock().unwrap();
        let mut by_dependency: HashMap<String, DependencySummary> = HashMap::new();
        let mut response_sums: HashMap<String, (f64, u64)> = HashMap::new();
        let mut total_points = 0;

        for point in buffer.iter().filter(|p| p.timestamp >= cutoff) {
            total_points += 1;
            let summary = by_dependency.entry(point.dependency.clone()).or_default();
            *summary.count_by_type.entry(point.metric_type).or_insert(0) += 1;

            if point.metric_type == MetricType::Request {
                summary.requests += 1;
                if !point.success {
                    summary.failures += 1;
                }
                let (sum, count) = response_sums.entry(point.dependency.clone()).or_insert((0.0, 0));
                *sum += point.value;
                *count += 1;
            }
        }

        for (dependency, (sum, count)) in response_sums {
            if count > 0 {
                if let Some(summary) = by_dependency.get_mut(&dependency) {
                    summary.avg_response_time_ms = Some(sum / count as f64);
                }
            }
        }

        MetricsSummary {
            generated_at: now,
            window_ms: window.as_millis() as u64,
            total_points,
            by_dependency,
        }
    }
}

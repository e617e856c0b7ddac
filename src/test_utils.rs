// src/test_utils.rs

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::config::{DependencyConfig, GuardConfig};
use crate::error::{ErrorClass, UpstreamError};
use crate::health::HealthProbe;
use crate::monitoring::{AlertEvent, AlertHandler};
use crate::rate_window::RateLimitConfig;
use crate::retry::{RetryPolicy, RetryPolicyTable};

/// Scripted upstream for tests: pops one outcome per call, then keeps
/// returning `Ok("ok")` when the script runs out.
pub struct MockUpstream {
    script: Mutex<VecDeque<Result<String, UpstreamError>>>,
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl MockUpstream {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Fails the first `n` calls with clones of `err`, then succeeds
    pub fn failing_times(n: usize, err: UpstreamError) -> Self {
        let mock = Self::new();
        for _ in 0..n {
            mock.push(Err(err.clone()));
        }
        mock
    }

    /// Every call takes at least `delay` before resolving
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push(&self, outcome: Result<String, UpstreamError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn call(&self) -> Result<String, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok("ok".to_string()))
    }
}

/// Scripted health probe with a call counter
pub struct ScriptedProbe {
    outcome: Mutex<Result<bool, UpstreamError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    pub fn returning(outcome: Result<bool, UpstreamError>) -> Self {
        Self {
            outcome: Mutex::new(outcome),
            delay: Mutex::new(None),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set_outcome(&self, outcome: Result<bool, UpstreamError>) {
        *self.outcome.lock().unwrap() = outcome;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> Result<bool, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.outcome.lock().unwrap().clone()
    }
}

/// Alert observer that records every event it sees
#[derive(Default)]
pub struct RecordingAlertHandler {
    events: Mutex<Vec<AlertEvent>>,
}

impl RecordingAlertHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, alert_type: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.alert_type == alert_type)
            .count()
    }
}

impl AlertHandler for RecordingAlertHandler {
    fn on_alert(&self, event: &AlertEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// A retry policy with no jitter and millisecond-scale delays, so retry
/// tests run fast and deterministically
pub fn fast_policy(max_retries: usize) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter_fraction: 0.0,
        max_delay: Duration::from_millis(50),
    }
}

/// Dependency configuration tuned for fast tests
pub fn fast_dependency_config(failure_threshold: usize, max_retries: usize) -> DependencyConfig {
    DependencyConfig {
        failure_threshold,
        recovery_timeout: Duration::from_millis(100),
        half_open_max_calls: 2,
        rate_limits: Vec::new(),
        retry_policies: RetryPolicyTable::default()
            .with_policy(ErrorClass::Default, fast_policy(max_retries))
            .with_policy(ErrorClass::ServerError, fast_policy(max_retries))
            .with_policy(ErrorClass::Timeout, fast_policy(max_retries))
            .with_policy(ErrorClass::Connection, fast_policy(max_retries))
            .with_policy(ErrorClass::RateLimit, fast_policy(max_retries)),
        timeout: Duration::from_millis(500),
        ..DependencyConfig::default()
    }
}

/// Single-dependency guard configuration tuned for fast tests
pub fn fast_guard_config(
    name: &str,
    failure_threshold: usize,
    max_retries: usize,
    rate_limits: Vec<RateLimitConfig>,
) -> GuardConfig {
    let mut dependency = fast_dependency_config(failure_threshold, max_retries);
    dependency.rate_limits = rate_limits;
    GuardConfig::single(name, dependency)
}

/// Shorthand for a 500-class server error
pub fn server_error() -> UpstreamError {
    UpstreamError::Server {
        status: 500,
        message: "internal error".to_string(),
    }
}

/// Shorthand for a 401 authentication failure
pub fn auth_error() -> UpstreamError {
    UpstreamError::Auth {
        status: 401,
        message: "invalid api key".to_string(),
    }
}

// src/rate_window.rs

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::duration_serde;

/// Configuration for one quota window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum number of admitted requests per window
    pub max_requests: u64,

    /// Window duration
    #[serde(with = "duration_serde")]
    pub window: Duration,
}

/// A fixed window counting admitted requests against one quota.
///
/// The window rolls lazily: any check or record past `window_start +
/// window` first resets the counter, so a long-idle dependency is never
/// permanently limited.
#[derive(Debug)]
pub struct RateLimitWindow {
    config: RateLimitConfig,
    requests_made: u64,
    window_start: Instant,
}

impl RateLimitWindow {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            requests_made: 0,
            window_start: Instant::now(),
        }
    }

    // Reset must happen before any count comparison
    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.window_start) > self.config.window {
            self.requests_made = 0;
            self.window_start = now;
        }
    }

    /// Whether this window refuses further requests right now
    pub fn is_limited(&mut self) -> bool {
        self.is_limited_at(Instant::now())
    }

    /// Same as [`RateLimitWindow::is_limited`] with an explicit clock,
    /// used by tests to simulate the passage of time
    pub fn is_limited_at(&mut self, now: Instant) -> bool {
        self.roll(now);
        self.requests_made >= self.config.max_requests
    }

    /// Count one admitted request. Called once per admission, not per
    /// retry attempt.
    pub fn record_request(&mut self) {
        self.record_request_at(Instant::now());
    }

    /// Same as [`RateLimitWindow::record_request`] with an explicit clock
    pub fn record_request_at(&mut self, now: Instant) {
        self.roll(now);
        self.requests_made += 1;
    }

    /// When the current window expires and the counter resets
    pub fn reset_at(&self) -> Instant {
        self.window_start + self.config.window
    }

    /// Requests counted in the current window
    pub fn requests_made(&self) -> u64 {
        self.requests_made
    }
}

/// All quota windows of one dependency (e.g. per-minute and per-day).
///
/// The dependency is rate-limited if ANY window reports limited.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    windows: Mutex<Vec<RateLimitWindow>>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, configs: Vec<RateLimitConfig>) -> Self {
        Self {
            name: name.into(),
            windows: Mutex::new(configs.into_iter().map(RateLimitWindow::new).collect()),
        }
    }

    /// Check all windows; returns the time until the binding window resets
    /// when limited, `None` when the request may proceed
    pub async fn check_limited(&self) -> Option<Duration> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();

        for window in windows.iter_mut() {
            if window.is_limited_at(now) {
                let reset_after = window.reset_at().saturating_duration_since(now);
                debug!(
                    dependency = %self.name,
                    requests_made = window.requests_made(),
                    reset_after_ms = reset_after.as_millis() as u64,
                    "request rate limited"
                );
                return Some(reset_after);
            }
        }

        None
    }

    /// Count one admitted request in every window
    pub async fn record_request(&self) {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();

        for window in windows.iter_mut() {
            window.record_request_at(now);
        }
    }
}

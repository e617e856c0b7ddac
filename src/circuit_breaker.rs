// src/circuit_breaker.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::duration_serde;

/// The state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests fail fast without reaching the dependency
    Open,
    /// Circuit is partially open, admitting a limited number of trial calls
    HalfOpen,
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// How long the circuit stays open before admitting trial calls
    #[serde(default = "default_recovery_timeout", with = "duration_serde")]
    pub recovery_timeout: Duration,
    /// Trial calls admitted in half-open; that many consecutive successes
    /// re-close the circuit
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

fn default_failure_threshold() -> usize {
    5
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max_calls() -> usize {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// A state transition, reported so the monitoring layer can raise alerts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Point-in-time snapshot of a breaker, for dashboards
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerInfo {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    pub half_open_calls_made: usize,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    /// Time until the next trial call is admitted; `Some` only while open
    #[serde(with = "duration_serde::option")]
    pub retry_after: Option<Duration>,
}

// All mutable fields live behind one mutex so transitions are atomic.
// `next_attempt` is Some exactly while the state is Open.
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    consecutive_successes: usize,
    half_open_calls_made: usize,
    last_failure: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
    next_attempt: Option<Instant>,
}

/// Per-dependency circuit breaker.
///
/// Decides whether an operation may even be attempted; it never executes
/// the operation itself. Callers report outcomes through
/// [`CircuitBreaker::record_success`] and [`CircuitBreaker::record_failure`].
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Dependency this breaker guards, for log context
    name: String,
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new closed breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_calls_made: 0,
                last_failure: None,
                last_success: None,
                next_attempt: None,
            }),
            config,
        }
    }

    /// Check whether a call may be attempted right now.
    ///
    /// While open, the first check at or after `next_attempt` flips the
    /// breaker to half-open and is itself counted as the first trial call.
    /// In half-open, each admission consumes one of the
    /// `half_open_max_calls` trial slots.
    pub async fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let due = inner
                    .next_attempt
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);

                if due {
                    inner.state = CircuitState::HalfOpen;
                    inner.next_attempt = None;
                    inner.consecutive_successes = 0;
                    inner.half_open_calls_made = 1;
                    debug!(
                        dependency = %self.name,
                        "circuit breaker transitioned to half-open, admitting trial call"
                    );
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_calls_made < self.config.half_open_max_calls {
                    inner.half_open_calls_made += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful operation
    pub async fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().await;
        inner.last_success = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                None
            }
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;

                if inner.consecutive_successes >= self.config.half_open_max_calls {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.half_open_calls_made = 0;
                    inner.next_attempt = None;
                    debug!(
                        dependency = %self.name,
                        "circuit breaker closed after successful trial calls"
                    );
                    Some(CircuitTransition {
                        from: CircuitState::HalfOpen,
                        to: CircuitState::Closed,
                    })
                } else {
                    None
                }
            }
            CircuitState::Open => {
                // A success can only land here if the caller was admitted
                // before the breaker opened; it does not re-close anything.
                debug!(
                    dependency = %self.name,
                    "success recorded while circuit open, ignoring"
                );
                None
            }
        }
    }

    /// Record a failed operation
    pub async fn record_failure(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout);
                    inner.half_open_calls_made = 0;
                    warn!(
                        dependency = %self.name,
                        consecutive_failures = inner.consecutive_failures,
                        recovery_timeout_ms = self.config.recovery_timeout.as_millis() as u64,
                        "circuit breaker opened"
                    );
                    Some(CircuitTransition {
                        from: CircuitState::Closed,
                        to: CircuitState::Open,
                    })
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                // Any failure during the trial discards partial progress
                inner.state = CircuitState::Open;
                inner.next_attempt = Some(Instant::now() + self.config.recovery_timeout);
                inner.consecutive_successes = 0;
                inner.half_open_calls_made = 0;
                warn!(
                    dependency = %self.name,
                    "circuit breaker re-opened after failure in half-open state"
                );
                Some(CircuitTransition {
                    from: CircuitState::HalfOpen,
                    to: CircuitState::Open,
                })
            }
            CircuitState::Open => None,
        }
    }

    /// Give back a trial slot consumed by [`CircuitBreaker::can_execute`]
    /// when the admitted call ended in neither success nor failure (a
    /// cancelled attempt, or a rejection after admission). Half-open has
    /// no recovery timer, so leaked slots would wedge the breaker until a
    /// manual reset.
    pub async fn release_trial(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen && inner.half_open_calls_made > 0 {
            inner.half_open_calls_made -= 1;
            debug!(
                dependency = %self.name,
                "half-open trial slot released after neutral outcome"
            );
        }
    }

    /// Get the current state of the circuit breaker
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Time until the next trial call is admitted; `Some` only while open
    pub async fn retry_after(&self) -> Option<Duration> {
        let inner = self.inner.lock().await;
        inner
            .next_attempt
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Snapshot the breaker for dashboards
    pub async fn info(&self) -> CircuitBreakerInfo {
        let inner = self.inner.lock().await;
        CircuitBreakerInfo {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_calls_made: inner.half_open_calls_made,
            last_failure: inner.last_failure,
            last_success: inner.last_success,
            retry_after: inner
                .next_attempt
                .map(|at| at.saturating_duration_since(Instant::now())),
        }
    }

    /// Force the breaker back to a fresh closed state (administrative)
    pub async fn reset(&self) -> Option<CircuitTransition> {
        let mut inner = self.inner.lock().await;
        let from = inner.state;

        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_calls_made = 0;
        inner.next_attempt = None;

        if from != CircuitState::Closed {
            warn!(dependency = %self.name, previous_state = ?from, "circuit breaker manually reset");
            Some(CircuitTransition {
                from,
                to: CircuitState::Closed,
            })
        } else {
            None
        }
    }
}

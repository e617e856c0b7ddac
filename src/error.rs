// src/error.rs

// Error taxonomy for the resilience layer. Upstream operations report a
// tagged `UpstreamError`; it is classified exactly once at the boundary
// into an `ErrorClass` that drives retry-policy selection.
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Outcome of a failed upstream call, tagged by the transport layer.
///
/// Callers of [`crate::UpstreamGuard::execute`] construct these from their
/// transport of choice (HTTP status codes, socket errors, SDK error kinds)
/// so that the retry loop never has to re-parse error strings.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    /// The attempt exceeded the dependency's configured timeout
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The dependency was unreachable (DNS, connect, reset, ...)
    #[error("connection error: {0}")]
    Connection(String),

    /// The dependency signalled a rate limit (e.g. HTTP 429)
    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    /// Authentication or authorization rejected (e.g. HTTP 401/403).
    /// Never retried.
    #[error("authentication rejected (status {status}): {message}")]
    Auth { status: u16, message: String },

    /// Server-side failure (HTTP 5xx)
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// Anything that does not fit the categories above
    #[error("upstream error: {0}")]
    Other(String),
}

impl UpstreamError {
    /// Map this error to the class used for retry-policy lookup.
    ///
    /// `Auth` maps to `Default` but is excluded from retries entirely via
    /// [`UpstreamError::is_retryable`].
    pub fn class(&self) -> ErrorClass {
        match self {
            UpstreamError::Timeout { .. } => ErrorClass::Timeout,
            UpstreamError::Connection(_) => ErrorClass::Connection,
            UpstreamError::RateLimited { .. } => ErrorClass::RateLimit,
            UpstreamError::Server { .. } => ErrorClass::ServerError,
            UpstreamError::Auth { .. } | UpstreamError::Other(_) => ErrorClass::Default,
        }
    }

    /// Whether the retry loop may attempt this operation again
    pub fn is_retryable(&self) -> bool {
        !matches!(self, UpstreamError::Auth { .. })
    }
}

/// Classification used to select a retry policy.
///
/// Re-evaluated on every attempt, so a run that starts with a timeout and
/// then hits a 429 switches to the rate-limit policy mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    Connection,
    RateLimit,
    ServerError,
    Default,
}

/// Errors returned by the resilience layer itself.
///
/// `CircuitOpen` and `RateLimited` mean the operation was *not attempted*;
/// `RetriesExhausted` and `Upstream` mean it was attempted and failed.
/// Callers can use this distinction to avoid retry-of-retry storms.
#[derive(Error, Debug)]
pub enum GuardError {
    /// The circuit breaker refused the call without attempting it
    #[error("circuit open for '{dependency}', retry after {retry_after:?}")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    /// A rate-limit window refused the call without attempting it
    #[error("rate limited for '{dependency}', resets in {reset_after:?}")]
    RateLimited {
        dependency: String,
        reset_after: Duration,
    },

    /// The dependency name is not configured
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// All retry attempts failed; carries the last upstream error
    #[error("'{dependency}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        dependency: String,
        attempts: usize,
        source: UpstreamError,
    },

    /// A non-retryable upstream failure, surfaced after a single attempt
    #[error("upstream call failed: {0}")]
    Upstream(#[from] UpstreamError),

    /// The caller's deadline expired before the operation completed
    #[error("operation cancelled for '{dependency}'")]
    Cancelled { dependency: String },

    /// Configuration-related errors
    #[error("configuration error: {0}")]
    Config(String),
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<serde_json::Error> for GuardError {
    fn from(err: serde_json::Error) -> Self {
        GuardError::Config(err.to_string())
    }
}

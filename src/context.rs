// src/context.rs

// Request-scoped context passed explicitly down the call chain. Carries the
// correlation id used in structured logs and an optional caller deadline
// that cancels the retry loop.
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Per-call context for [`crate::UpstreamGuard::execute`].
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id stamped on every log line and metric for this call
    pub correlation_id: Uuid,
    /// Logical operation name, e.g. "generate_summary" or "fetch_headlines"
    pub operation: String,
    /// Absolute deadline; when it passes, the current attempt and any
    /// remaining retries are abandoned
    pub deadline: Option<Instant>,
}

impl RequestContext {
    /// Create a context with a fresh correlation id and no deadline
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            operation: operation.into(),
            deadline: None,
        }
    }

    /// Create a context that cancels the whole call after `budget`
    pub fn with_deadline(operation: impl Into<String>, budget: Duration) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            operation: operation.into(),
            deadline: Some(Instant::now() + budget),
        }
    }

    /// Time left until the deadline; `None` when no deadline was set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the caller's deadline has already passed
    pub fn is_cancelled(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }
}

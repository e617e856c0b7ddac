// src/logging.rs

use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Ensure initialization happens only once
static INIT: Once = Once::new();

/// Initialize the logging system with sensible defaults.
///
/// Log level can be set using the RUST_LOG environment variable.
/// Example: RUST_LOG=debug,upstream_guard=trace
pub fn init() {
    INIT.call_once(|| {
        // Default to 'info' level if RUST_LOG is not specified
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(true) // Include module path in logs
                    .with_thread_ids(true) // Useful for debugging concurrency issues
                    .with_line_number(true),
            )
            .init();

        tracing::info!("Logging initialized");
    });
}

/// Macro for logging guarded upstream calls with structured fields
#[macro_export]
macro_rules! guarded_call_event {
    ($dependency:expr, $operation:expr, $success:expr, $response_time_ms:expr, $correlation_id:expr) => {
        tracing::info!(
            dependency = $dependency,
            operation = $operation,
            success = $success,
            response_time_ms = $response_time_ms,
            correlation_id = %$correlation_id,
            "Guarded upstream call"
        )
    };
}

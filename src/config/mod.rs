// src/config/mod.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::Result;
use crate::health::HealthProbeConfig;
use crate::monitoring::AlertThresholds;
use crate::rate_window::RateLimitConfig;
use crate::retry::RetryPolicyTable;

/// Configuration for one named upstream dependency.
///
/// Created at startup; the dependency lives for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Consecutive failures before the circuit opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// How long the circuit stays open before admitting trial calls
    #[serde(default = "default_recovery_timeout", with = "duration_serde")]
    pub recovery_timeout: Duration,

    /// Trial calls required to re-close the circuit
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,

    /// Quota windows; the dependency is limited if ANY window is limited
    #[serde(default)]
    pub rate_limits: Vec<RateLimitConfig>,

    /// Backoff parameters per error class, with a default fallback
    #[serde(default)]
    pub retry_policies: RetryPolicyTable,

    /// Probe timing and freshness settings
    #[serde(default)]
    pub health_probe: HealthProbeConfig,

    /// Thresholds that trigger monitoring alerts
    #[serde(default)]
    pub alert_thresholds: AlertThresholds,

    /// Per-attempt timeout for operations against this dependency
    #[serde(default = "default_timeout", with = "duration_serde")]
    pub timeout: Duration,
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

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout: default_recovery_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
            rate_limits: Vec::new(),
            retry_policies: RetryPolicyTable::default(),
            health_probe: HealthProbeConfig::default(),
            alert_thresholds: AlertThresholds::default(),
            timeout: default_timeout(),
        }
    }
}

impl DependencyConfig {
    /// The circuit-breaker slice of this configuration
    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            half_open_max_calls: self.half_open_max_calls,
        }
    }
}

/// Top-level configuration for [`crate::UpstreamGuard`]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GuardConfig {
    /// Dependencies keyed by name
    pub dependencies: HashMap<String, DependencyConfig>,

    /// Capacity of the metrics ring buffer
    #[serde(default = "default_metrics_capacity")]
    pub metrics_capacity: usize,

    /// Bounded queue size for each live metrics subscriber
    #[serde(default = "default_subscriber_queue_size")]
    pub subscriber_queue_size: usize,

    /// How many alert events to keep in history
    #[serde(default = "default_alert_history_size")]
    pub alert_history_size: usize,

    /// Rolling sample count for response-time averages and failure rates
    #[serde(default = "default_response_sample_size")]
    pub response_sample_size: usize,
}

fn default_metrics_capacity() -> usize {
    1000
}

fn default_subscriber_queue_size() -> usize {
    64
}

fn default_alert_history_size() -> usize {
    500
}

fn default_response_sample_size() -> usize {
    100
}

impl GuardConfig {
    /// Parse a configuration from its JSON representation
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Convenience constructor for a single-dependency configuration
    pub fn single(name: impl Into<String>, dependency: DependencyConfig) -> Self {
        let mut dependencies = HashMap::new();
        dependencies.insert(name.into(), dependency);
        Self {
            dependencies,
            metrics_capacity: default_metrics_capacity(),
            subscriber_queue_size: default_subscriber_queue_size(),
            alert_history_size: default_alert_history_size(),
            response_sample_size: default_response_sample_size(),
        }
    }
}

// Helper module to serialize/deserialize Duration with serde (milliseconds)
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    // Same encoding for Option<Duration> fields
    pub(crate) mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        #[allow(dead_code)]
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}

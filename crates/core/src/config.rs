//! Resilience settings
//!
//! Loaded from TOML. Every field is optional; missing fields keep their
//! defaults. Per-category overrides live under `[categories.<name>]`:
//!
//! ```toml
//! cleanup_interval_secs = 3600
//! circuit_ttl_secs = 86400
//! max_circuits = 256
//!
//! [categories.version-control]
//! failure_threshold = 3
//! reset_timeout_ms = 120000
//! max_attempts = 5
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use relaygate_common::error::{CommonError, CommonResult};
use relaygate_common::observability::EventReporterConfig;
use relaygate_common::resilience::{
    CircuitBreakerConfig, ConfigError, JitterRange, RegistryLimits, RetryPolicy,
};
use relaygate_common::option_duration_millis;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::category::BackendCategory;

/// Settings for the backend guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceSettings {
    /// Seconds between cleanup sweeps
    pub cleanup_interval_secs: u64,
    /// Idle seconds after which a circuit record is dropped
    pub circuit_ttl_secs: u64,
    /// Maximum number of live circuit records
    pub max_circuits: usize,
    /// Capacity of the event queue
    pub event_queue_capacity: usize,
    /// Upper bound on one event sink delivery, in milliseconds
    pub event_timeout_ms: u64,
    /// Overrides keyed by category name
    pub categories: BTreeMap<String, CategoryOverrides>,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        let limits = RegistryLimits::default();
        let events = EventReporterConfig::default();
        Self {
            cleanup_interval_secs: 60 * 60,
            circuit_ttl_secs: limits.ttl.as_secs(),
            max_circuits: limits.max_circuits,
            event_queue_capacity: events.capacity,
            event_timeout_ms: u64::try_from(events.delivery_timeout.as_millis()).unwrap_or(u64::MAX),
            categories: BTreeMap::new(),
        }
    }
}

/// Per-category overrides of the circuit and retry defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CategoryOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success_threshold: Option<u32>,
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub reset_timeout_ms: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<Duration>,
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_multiplier: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_max: Option<f64>,
}

impl CategoryOverrides {
    fn apply_circuit(&self, mut config: CircuitBreakerConfig) -> CircuitBreakerConfig {
        if let Some(threshold) = self.failure_threshold {
            config.failure_threshold = threshold;
        }
        if let Some(threshold) = self.success_threshold {
            config.success_threshold = threshold;
        }
        if let Some(timeout) = self.reset_timeout_ms {
            config.reset_timeout = timeout;
        }
        config
    }

    fn apply_retry(&self, mut policy: RetryPolicy) -> RetryPolicy {
        if let Some(attempts) = self.max_attempts {
            policy.max_attempts = attempts;
        }
        if let Some(delay) = self.initial_delay_ms {
            policy.initial_delay = delay;
        }
        if let Some(delay) = self.max_delay_ms {
            policy.max_delay = delay;
        }
        if let Some(multiplier) = self.backoff_multiplier {
            policy.backoff_multiplier = multiplier;
        }
        policy.jitter = JitterRange {
            min: self.jitter_min.unwrap_or(policy.jitter.min),
            max: self.jitter_max.unwrap_or(policy.jitter.max),
        };
        policy
    }
}

impl ResilienceSettings {
    /// Parse and validate settings from TOML text.
    ///
    /// # Errors
    /// Returns `CommonError::Config` for malformed TOML or invalid values.
    pub fn from_toml_str(text: &str) -> CommonResult<Self> {
        let settings: Self = toml::from_str(text)
            .map_err(|e| CommonError::config(format!("Invalid resilience settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read, parse and validate a TOML settings file.
    ///
    /// # Errors
    /// Returns `CommonError::Config` if the file cannot be read or is invalid.
    pub fn load<P: AsRef<Path>>(path: P) -> CommonResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CommonError::config(format!("Failed to read {}: {e}", path.display()))
        })?;
        let settings = Self::from_toml_str(&text)?;
        info!(
            path = %path.display(),
            categories = settings.categories.len(),
            "Resilience settings loaded"
        );
        Ok(settings)
    }

    /// Check every field and every category override.
    ///
    /// # Errors
    /// Returns `CommonError::Config` naming the first offending field.
    pub fn validate(&self) -> CommonResult<()> {
        if self.cleanup_interval_secs == 0 {
            return Err(CommonError::config_field("cleanup_interval_secs", "must be greater than 0"));
        }
        if self.circuit_ttl_secs == 0 {
            return Err(CommonError::config_field("circuit_ttl_secs", "must be greater than 0"));
        }
        if self.max_circuits == 0 {
            return Err(CommonError::config_field("max_circuits", "must be greater than 0"));
        }
        if self.event_queue_capacity == 0 {
            return Err(CommonError::config_field("event_queue_capacity", "must be greater than 0"));
        }
        if self.event_timeout_ms == 0 {
            return Err(CommonError::config_field("event_timeout_ms", "must be greater than 0"));
        }

        for name in self.categories.keys() {
            let category: BackendCategory = name.parse().map_err(|_| {
                CommonError::config_field(
                    format!("categories.{name}"),
                    "unknown backend category",
                )
            })?;
            self.circuit_config(category)?;
            self.retry_policy(category)?;
        }
        debug!(categories = self.categories.len(), "Resilience settings validated");
        Ok(())
    }

    fn overrides(&self, category: BackendCategory) -> Option<&CategoryOverrides> {
        self.categories.get(category.as_str())
    }

    /// Circuit thresholds for `category`, defaults with overrides applied.
    ///
    /// # Errors
    /// Returns `CommonError::Config` when the overridden values are invalid.
    pub fn circuit_config(&self, category: BackendCategory) -> CommonResult<CircuitBreakerConfig> {
        let defaults = category.circuit_config();
        let config = match self.overrides(category) {
            Some(overrides) => overrides.apply_circuit(defaults),
            None => defaults,
        };
        config.validate().map_err(|e| invalid(category, &e))?;
        Ok(config)
    }

    /// Retry policy for `category`, defaults with overrides applied.
    ///
    /// # Errors
    /// Returns `CommonError::Config` when the overridden values are invalid.
    pub fn retry_policy(&self, category: BackendCategory) -> CommonResult<RetryPolicy> {
        let defaults = category.retry_policy();
        let policy = match self.overrides(category) {
            Some(overrides) => overrides.apply_retry(defaults),
            None => defaults,
        };
        policy.validate().map_err(|e| invalid(category, &e))?;
        Ok(policy)
    }

    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            ttl: Duration::from_secs(self.circuit_ttl_secs),
            max_circuits: self.max_circuits,
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn event_reporter_config(&self) -> EventReporterConfig {
        EventReporterConfig {
            capacity: self.event_queue_capacity,
            delivery_timeout: Duration::from_millis(self.event_timeout_ms),
        }
    }
}

fn invalid(category: BackendCategory, error: &ConfigError) -> CommonError {
    CommonError::config_field(format!("categories.{category}"), error.to_string())
}

//! Control plane configuration
//!
//! One immutable struct, validated once when the control plane starts.
//! Every field has a default, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};

use crate::accelerator::TelemetryConfig;
use crate::cache::CacheConfig;
use crate::circuit_breaker::CircuitBreakerSettings;
use crate::error::{ControlError, ControlResult};
use crate::expert::ExpertSpec;
use crate::health::HealthConfig;
use crate::rate_limiter::RateLimitConfig;

/// Environment prefix for overrides, e.g. `EZIO_CACHE__CAPACITY=64`
pub const ENV_PREFIX: &str = "EZIO";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "ezio=info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Complete control plane configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub telemetry: TelemetryConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limit: RateLimitConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
    pub experts: Vec<ExpertSpec>,
}

impl ControlPlaneConfig {
    /// Load from a file (format from its extension) with `EZIO_*` overrides
    pub fn load(path: &str) -> ControlResult<Self> {
        let config: Self = ezio_kernel::config::load_with_env(path, ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `EZIO_*` overrides
    pub fn from_env() -> ControlResult<Self> {
        let config: Self = ezio_kernel::config::from_env(ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot run with
    pub fn validate(&self) -> ControlResult<()> {
        let t = &self.telemetry;
        non_zero("telemetry.sampling_interval_ms", t.sampling_interval_ms)?;
        non_zero("telemetry.query_timeout_ms", t.query_timeout_ms)?;
        non_zero("telemetry.shutdown_grace_ms", t.shutdown_grace_ms)?;

        non_zero("cache.capacity", self.cache.capacity as u64)?;
        non_zero("cache.default_ttl_secs", self.cache.default_ttl_secs)?;

        let breakers = std::iter::once(("circuit_breaker", &self.circuit_breaker.defaults)).chain(
            self.circuit_breaker
                .overrides
                .iter()
                .map(|(name, config)| (name.as_str(), config)),
        );
        for (name, config) in breakers {
            non_zero(
                &format!("{name}.failure_threshold"),
                config.failure_threshold as u64,
            )?;
            non_zero(&format!("{name}.cooldown_ms"), config.cooldown_ms)?;
        }

        non_zero("rate_limit.limit", self.rate_limit.limit as u64)?;
        non_zero("rate_limit.window_ms", self.rate_limit.window_ms)?;

        let h = &self.health;
        non_zero("health.poll_interval_secs", h.poll_interval_secs)?;
        non_zero("health.check_timeout_ms", h.check_timeout_ms)?;
        non_zero("health.staleness_threshold_secs", h.staleness_threshold_secs)?;
        if !(h.temperature_threshold_celsius > 0.0) {
            return Err(ControlError::Config(
                "health.temperature_threshold_celsius must be positive".into(),
            ));
        }
        if !(h.memory_threshold_percent > 0.0 && h.memory_threshold_percent <= 100.0) {
            return Err(ControlError::Config(
                "health.memory_threshold_percent must be in (0, 100]".into(),
            ));
        }
        if h.staleness_threshold() < t.sampling_interval() {
            return Err(ControlError::Config(format!(
                "health.staleness_threshold_secs ({}s) is shorter than the sampling interval ({}ms)",
                h.staleness_threshold_secs, t.sampling_interval_ms
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for expert in &self.experts {
            if expert.name.is_empty() {
                return Err(ControlError::Config("expert with empty name".into()));
            }
            if !seen.insert(expert.name.as_str()) {
                return Err(ControlError::Config(format!(
                    "expert '{}' is configured twice",
                    expert.name
                )));
            }
            if expert.required_memory_bytes().is_none() {
                return Err(ControlError::Config(format!(
                    "expert '{}' required_memory_mb ({}) is out of range",
                    expert.name, expert.required_memory_mb
                )));
            }
        }
        Ok(())
    }
}

fn non_zero(field: &str, value: u64) -> ControlResult<()> {
    if value == 0 {
        Err(ControlError::Config(format!("{field} must be greater than zero")))
    } else {
        Ok(())
    }
}

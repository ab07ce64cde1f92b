//! Error taxonomy for the control plane
//!
//! Caller-facing failures (`InsufficientCapacity`, `CircuitOpen`,
//! `RateLimited`, and `NoAcceleratorsFound` once the plane runs degraded)
//! are always returned explicitly. `HardwareQueryFailed` and
//! `StaleTelemetry` never escape their component: the sampler turns the
//! former into a stale device record, the health aggregator turns the
//! latter into an `Unhealthy` result.

use std::time::Duration;
use thiserror::Error;

use crate::accelerator::AcceleratorId;

/// Control plane errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ControlError {
    /// Discovery reported zero devices; allocation runs in always-fail mode
    #[error("no accelerators found")]
    NoAcceleratorsFound,

    /// No accelerator can currently host the workload
    #[error("insufficient capacity for workload '{workload}': {required_bytes} bytes required")]
    InsufficientCapacity {
        workload: String,
        required_bytes: u64,
    },

    /// The breaker guarding the dependency is rejecting calls
    #[error("circuit open for dependency '{dependency}'")]
    CircuitOpen { dependency: String },

    /// The caller exhausted its window
    #[error("rate limited: '{key}' may retry in {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    /// Telemetry for an accelerator has not been refreshed in time
    #[error("telemetry for accelerator {accelerator} is stale ({age:?} old)")]
    StaleTelemetry {
        accelerator: AcceleratorId,
        age: Duration,
    },

    /// A single hardware query failed
    #[error("hardware query failed for {device}: {reason}")]
    HardwareQueryFailed { device: String, reason: String },

    /// Configuration rejected at construction
    #[error("configuration error: {0}")]
    Config(String),
}

impl ControlError {
    /// `true` for the "try again later" signals surfaced to callers
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::NoAcceleratorsFound
                | ControlError::InsufficientCapacity { .. }
                | ControlError::CircuitOpen { .. }
                | ControlError::RateLimited { .. }
        )
    }
}

impl From<ezio_kernel::config::ConfigError> for ControlError {
    fn from(err: ezio_kernel::config::ConfigError) -> Self {
        ControlError::Config(err.to_string())
    }
}

/// Result type for control plane operations
pub type ControlResult<T> = Result<T, ControlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_facing_errors_are_retryable() {
        assert!(ControlError::NoAcceleratorsFound.is_retryable());
        assert!(ControlError::InsufficientCapacity {
            workload: "m".into(),
            required_bytes: 1
        }
        .is_retryable());
        assert!(ControlError::CircuitOpen {
            dependency: "llm".into()
        }
        .is_retryable());
        assert!(ControlError::RateLimited {
            key: "k".into(),
            retry_after: Duration::from_secs(1)
        }
        .is_retryable());
    }

    #[test]
    fn test_internal_errors_are_not_retryable() {
        assert!(!ControlError::Config("bad".into()).is_retryable());
        assert!(!ControlError::HardwareQueryFailed {
            device: "gpu0".into(),
            reason: "timeout".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_display_mentions_workload() {
        let err = ControlError::InsufficientCapacity {
            workload: "model-x".into(),
            required_bytes: 4096,
        };
        assert!(err.to_string().contains("model-x"));
    }
}

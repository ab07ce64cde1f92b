// accelerator module - discovery, probes and the telemetry sampler
pub mod accelerator;

// allocation module - workload placement on accelerators
pub mod allocation;

// cache module - LRU + TTL result cache
pub mod cache;

// Circuit breaker module - per-dependency failure isolation
pub mod circuit_breaker;

// config module
pub mod config;

// control plane wiring
pub mod control_plane;

pub mod error;

// expert module - capability-typed expert registry
pub mod expert;

// health module - checks, aggregation and background polling
pub mod health;

// rate limiter module - fixed-window per-key limits
pub mod rate_limiter;

pub use accelerator::{
    AcceleratorId, AcceleratorRegistry, AcceleratorState, HardwareProbe, MockProbe,
    NvidiaSmiProbe, TelemetryConfig, TelemetrySampler, TelemetrySnapshot,
};
pub use allocation::{Allocation, AllocationManager};
pub use cache::{Cache, CacheConfig, CacheStats};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry,
    CircuitBreakerSettings, State as CircuitState,
};
pub use config::{ControlPlaneConfig, LogFormat, LoggingConfig};
pub use control_plane::{ControlPlane, ExpertPlacement, ResultCache};
pub use error::{ControlError, ControlResult};
pub use expert::{Capability, Expert, ExpertRegistry, ExpertSpec};
pub use health::{
    HealthAggregator, HealthCheck, HealthCheckResult, HealthConfig, HealthMonitor, HealthReport,
    HealthStatus,
};
pub use rate_limiter::{RateLimitConfig, RateLimitResult, RateLimiter};

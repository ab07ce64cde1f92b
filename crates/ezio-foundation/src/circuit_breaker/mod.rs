//! Circuit Breaker Pattern Implementation
//!
//! One breaker per external dependency, created on demand by
//! [`CircuitBreakerRegistry`].
//!
//! # Architecture
//!
//! ```text
//!     +---------+   failure threshold   +--------+
//!     | CLOSED  | --------------------> |  OPEN  | <-----+
//!     +---------+                       +--------+       |
//!          ^                                 |           |
//!          |                                 | cooldown  | trial fails
//!          |                                 v           |
//!          |     trial succeeds       +-------------+    |
//!          +------------------------- |  HALF-OPEN  | ---+
//!                                     +-------------+
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use ezio_foundation::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerConfig};
//!
//! let breakers = CircuitBreakerRegistry::with_config(CircuitBreakerConfig::default());
//! match breakers.call("llm", client.complete(prompt)).await {
//!     Ok(reply) => reply,
//!     Err(e) if e.is_open() => return Err(e.as_control_error().unwrap()),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

pub mod config;
pub mod metrics;
pub mod registry;
pub mod state;

pub use config::{CircuitBreakerConfig, CircuitBreakerSettings};
pub use metrics::{CircuitBreakerMetrics, CircuitBreakerMetricsSnapshot, StateTransition};
pub use registry::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
pub use state::{CircuitBreaker, CircuitBreakerError, State};

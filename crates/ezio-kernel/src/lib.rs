//! # ezio-kernel
//!
//! Small shared layer underneath `ezio-foundation`. Today it only carries the
//! configuration loader; component configuration structs live next to the
//! components that consume them.

#[cfg(feature = "config")]
pub mod config;

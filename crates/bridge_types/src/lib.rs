//! Shared types for the telemetry plugin bridge
//!
//! This crate contains the types exchanged between the bridge server, the frame
//! producers that feed it, and the host daemon: the `Frame` capability, the
//! concrete telemetry record emitted by devices, and the bridge configuration.

pub mod config;
pub mod frame;
pub mod telemetry;

// Re-export commonly used types
pub use config::*;
pub use frame::*;
pub use telemetry::*;

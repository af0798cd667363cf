//! Plugin bridge server
//!
//! Exposes live decoded telemetry frames and the raw device byte stream to
//! external plugin processes over TCP, and relays whatever those plugins send
//! back to the device.
//!
//! All bridge state lives inside a single reactor task ([`server::PluginServer`]);
//! producers and the host talk to it through a cloneable [`server::BridgeHandle`].

pub mod aggregator;
pub mod bridge;
pub mod connection;
pub mod error;
pub mod listener;
pub mod registry;
pub mod server;
pub mod sink;
pub mod ticker;
pub mod wire;

// Re-export commonly used types
pub use bridge::{BridgeMetrics, FanOutReport, PluginBridge, TickOutcome};
pub use connection::{Connection, ConnectionEvent, ConnectionId, TcpConnection};
pub use error::{BridgeError, BridgeResult, SendError};
pub use listener::{Listener, Listening};
pub use server::{BridgeHandle, BridgeStatus, PluginServer};
pub use sink::{DeviceSink, DiscardSink};
pub use ticker::spawn_ticker;

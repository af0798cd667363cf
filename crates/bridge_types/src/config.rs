//! Configuration types for the plugin bridge

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Well-known port plugins connect to.
pub const DEFAULT_PLUGIN_PORT: u16 = 7777;

/// Configuration for the plugin bridge server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address the listener binds to (all interfaces by default)
    pub bind_address: IpAddr,
    /// TCP port plugins connect to
    pub port: u16,
    /// Whether the bridge accepts and feeds plugins right after startup
    pub enabled: bool,
    /// Period of the frame broadcast tick in milliseconds
    pub tick_interval_ms: u64,
    /// Number of outbound lines buffered per connection before writes are skipped
    pub write_queue_capacity: usize,
    /// Upper bound on frames held between ticks; oldest frames are dropped first.
    /// `None` keeps every frame until the next broadcast.
    pub max_pending_frames: Option<usize>,
    /// Size of the buffer each connection reads plugin data into
    pub read_chunk_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PLUGIN_PORT,
            enabled: false,
            tick_interval_ms: 1000,
            write_queue_capacity: 64,
            max_pending_frames: None,
            read_chunk_size: 4096,
        }
    }
}

impl BridgeConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

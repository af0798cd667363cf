use std::path::Path;

use anyhow::{Context, Result};
use bridge_types::BridgeConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Configuration for the simulated device feeding the bridge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockDeviceConfig {
    /// Whether the daemon runs the simulated device at all
    pub enabled: bool,
    /// Title carried by every generated frame
    pub title: String,
    /// Frames produced per second
    pub frame_rate_hz: u32,
    /// Number of simulated channels (channel i oscillates at 2 + 4*i Hz)
    pub channels: usize,
    /// Echo bytes written back by plugins on the raw channel, like a loopback device
    pub echo_write_back: bool,
}

impl Default for MockDeviceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            title: "Mock Device".to_string(),
            frame_rate_hz: 10,
            channels: 4,
            echo_write_back: false,
        }
    }
}

/// Configuration for the daemon
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Plugin bridge server settings
    pub bridge: BridgeConfig,
    /// Simulated device settings
    pub mock_device: MockDeviceConfig,
}

/// Loads the daemon configuration, falling back to defaults when the file does not exist.
pub fn load_config(path: &Path) -> Result<DaemonConfig> {
    if !path.exists() {
        info!(path = %path.display(), "No configuration file found, using defaults");
        return Ok(DaemonConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read configuration file at '{}'", path.display()))?;
    let config: DaemonConfig = serde_json::from_str(&contents)
        .with_context(|| format!("Could not parse configuration file at '{}'", path.display()))?;

    info!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

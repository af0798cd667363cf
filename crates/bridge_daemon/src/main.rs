use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use bridge_daemon::config::{load_config, DEFAULT_CONFIG_PATH};
use bridge_daemon::mock_device::MockDevice;
use bytes::Bytes;
use clap::{Arg, ArgAction, Command};
use plugin_bridge::{spawn_ticker, DeviceSink, DiscardSink, PluginServer};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "plugin_bridged=info,bridge_daemon=info,plugin_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Plugin bridge daemon starting...");

    // --- Argument Parsing ---
    let matches = Command::new("plugin_bridged")
        .about("Streams device data to external plugins over TCP")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_name("PATH")
                .default_value(DEFAULT_CONFIG_PATH)
                .help("Path to the JSON configuration file"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .short('p')
                .value_parser(clap::value_parser!(u16))
                .help("Override the plugin server port"),
        )
        .arg(
            Arg::new("enable")
                .long("enable")
                .action(ArgAction::SetTrue)
                .help("Accept plugin connections from startup"),
        )
        .arg(
            Arg::new("no-mock")
                .long("no-mock")
                .action(ArgAction::SetTrue)
                .help("Do not run the simulated device"),
        )
        .get_matches();

    let config_path = matches
        .get_one::<String>("config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = load_config(&config_path)?;
    if let Some(port) = matches.get_one::<u16>("port") {
        config.bridge.port = *port;
    }
    if matches.get_flag("enable") {
        config.bridge.enabled = true;
    }
    if matches.get_flag("no-mock") {
        config.mock_device.enabled = false;
    }

    // --- Plugin Server ---
    let (write_back_tx, write_back_rx) = flume::unbounded::<Bytes>();
    let sink: Arc<dyn DeviceSink> = if config.mock_device.enabled {
        Arc::new(write_back_tx)
    } else {
        tracing::info!("No device attached, plugin writes will be discarded");
        Arc::new(DiscardSink)
    };

    let (mut server, handle) = PluginServer::new(config.bridge.clone(), sink);
    // A bind failure leaves the daemon running without plugins.
    let _ = server.start().await;

    let shutdown = CancellationToken::new();
    let server_handle = tokio::spawn(server.run(shutdown.clone()));
    let ticker_handle = spawn_ticker(handle.clone(), config.bridge.tick_interval(), shutdown.clone());

    // --- Device ---
    let device_handle = if config.mock_device.enabled {
        let device = MockDevice::new(config.mock_device.clone());
        Some(device.spawn(handle.clone(), write_back_rx, shutdown.clone()))
    } else {
        None
    };

    // --- Enabled State Reporting ---
    let mut enabled_rx = handle.subscribe_enabled();
    let watch_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = watch_shutdown.cancelled() => break,
                changed = enabled_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let enabled = *enabled_rx.borrow_and_update();
                    tracing::info!(enabled, "Plugin bridge enabled state changed");
                }
            }
        }
    });

    // --- Graceful Shutdown ---
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for the shutdown signal")?;
    tracing::info!("Shutdown signal received. Stopping services...");
    shutdown.cancel();

    if let Some(device_handle) = device_handle {
        device_handle.await.context("Mock device task panicked")?;
    }
    ticker_handle.await.context("Ticker task panicked")?;
    server_handle.await.context("Plugin server task panicked")?;

    tracing::info!("Plugin bridge daemon stopped gracefully.");

    Ok(())
}

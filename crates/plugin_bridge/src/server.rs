//! The bridge reactor and the handle used to feed it.
//!
//! [`PluginServer`] owns the listener and the [`PluginBridge`] state and runs a
//! single event loop. Frame producers, the device layer, the clock and the host
//! application reach it only through [`BridgeHandle`], whose calls are plain
//! channel sends and never block.

use std::net::SocketAddr;
use std::sync::Arc;

use bridge_types::{BridgeConfig, Frame, SharedFrame};
use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BridgeMetrics, PluginBridge, TickOutcome};
use crate::connection::{ConnectionEvent, ConnectionOptions, TcpConnection};
use crate::error::{BridgeError, BridgeResult};
use crate::listener::{self, Listener, Listening};
use crate::sink::DeviceSink;

/// Point-in-time view of the bridge.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStatus {
    pub enabled: bool,
    pub connections: usize,
    pub pending_frames: usize,
    pub listening: Option<SocketAddr>,
    pub metrics: BridgeMetrics,
}

/// Requests delivered to the reactor.
enum BridgeCommand {
    Frame(SharedFrame),
    RawBytes(Bytes),
    Tick,
    SetEnabled(bool),
    Status(oneshot::Sender<BridgeStatus>),
}

/// Cloneable entry point into a running [`PluginServer`].
#[derive(Clone)]
pub struct BridgeHandle {
    commands: flume::Sender<BridgeCommand>,
    enabled: watch::Receiver<bool>,
}

impl BridgeHandle {
    /// Queues a decoded frame for the next broadcast tick.
    pub fn register_frame<F>(&self, frame: F) -> BridgeResult<()>
    where
        F: Frame + 'static,
    {
        self.send(BridgeCommand::Frame(Arc::new(frame)))
    }

    /// Relays a chunk of raw device bytes to every plugin.
    pub fn on_raw_bytes(&self, bytes: impl Into<Bytes>) -> BridgeResult<()> {
        self.send(BridgeCommand::RawBytes(bytes.into()))
    }

    /// Flushes pending frames to every plugin.
    pub fn on_tick(&self) -> BridgeResult<()> {
        self.send(BridgeCommand::Tick)
    }

    pub fn set_enabled(&self, enabled: bool) -> BridgeResult<()> {
        self.send(BridgeCommand::SetEnabled(enabled))
    }

    /// The enabled state most recently applied by the reactor.
    pub fn enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Notified every time the enabled state is set.
    pub fn subscribe_enabled(&self) -> watch::Receiver<bool> {
        self.enabled.clone()
    }

    /// Asks the reactor for its current state.
    ///
    /// Commands are handled in order, so the status reflects every call made
    /// through this handle before it.
    pub async fn status(&self) -> BridgeResult<BridgeStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(BridgeCommand::Status(tx))?;
        rx.await.map_err(|_| BridgeError::ServerGone)
    }

    fn send(&self, command: BridgeCommand) -> BridgeResult<()> {
        self.commands
            .send(command)
            .map_err(|_| BridgeError::ServerGone)
    }
}

/// Single-task reactor serving plugin connections.
pub struct PluginServer {
    config: BridgeConfig,
    bridge: PluginBridge,
    listener: Listener,
    commands_rx: flume::Receiver<BridgeCommand>,
    events_tx: flume::Sender<ConnectionEvent>,
    events_rx: flume::Receiver<ConnectionEvent>,
    enabled_tx: watch::Sender<bool>,
}

impl PluginServer {
    /// Builds a stopped server. Nothing is bound until [`PluginServer::start`].
    ///
    /// The bridge starts disabled; the configured `enabled` flag is applied by
    /// [`PluginServer::run`].
    pub fn new(config: BridgeConfig, sink: Arc<dyn DeviceSink>) -> (Self, BridgeHandle) {
        let (commands_tx, commands_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();
        let (enabled_tx, enabled_rx) = watch::channel(false);

        let server = Self {
            bridge: PluginBridge::new(sink, config.max_pending_frames),
            config,
            listener: Listener::new(),
            commands_rx,
            events_tx,
            events_rx,
            enabled_tx,
        };
        let handle = BridgeHandle {
            commands: commands_tx,
            enabled: enabled_rx,
        };
        (server, handle)
    }

    /// Binds the configured address.
    ///
    /// A failure is logged and returned, but the server stays usable: `run`
    /// still serves the handle, there are just no plugins to feed.
    pub async fn start(&mut self) -> BridgeResult<Listening> {
        let addr = self.config.listen_addr();
        match self.listener.start(addr).await {
            Ok(listening) => Ok(listening),
            Err(e) => {
                warn!("{}; plugins cannot connect", e);
                Err(e)
            }
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the reactor until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            listening = ?self.listener.local_addr(),
            enabled = self.config.enabled,
            "Plugin server is running."
        );
        self.set_enabled(self.config.enabled);

        // Branches are polled in random order.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Plugin server received shutdown signal.");
                    break;
                }
                Ok(command) = self.commands_rx.recv_async() => {
                    self.handle_command(command);
                }
                Ok(event) = self.events_rx.recv_async() => {
                    self.bridge.handle_connection_event(event);
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_connection(stream, peer),
                    Err(e) => error!("Failed to accept plugin connection: {}", e),
                },
            }
        }

        self.bridge.shutdown();
        self.listener.stop();
        info!("Plugin server has shut down.");
    }

    fn handle_command(&mut self, command: BridgeCommand) {
        match command {
            BridgeCommand::Frame(frame) => self.bridge.register_frame(frame),
            BridgeCommand::RawBytes(bytes) => {
                self.bridge.on_raw_bytes(&bytes);
            }
            BridgeCommand::Tick => match self.bridge.on_tick() {
                TickOutcome::Broadcast { frames, report } => debug!(
                    frames,
                    delivered = report.delivered,
                    skipped = report.skipped,
                    dropped = report.dropped,
                    "Broadcast pending frames"
                ),
                TickOutcome::NoConnections { pending } => {
                    trace!(pending, "No plugins connected, keeping frames")
                }
                TickOutcome::NothingSent => debug!("No frame in the batch could be serialized"),
                TickOutcome::Disabled | TickOutcome::NothingPending => {}
            },
            BridgeCommand::SetEnabled(enabled) => self.set_enabled(enabled),
            BridgeCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.bridge.set_enabled(enabled);
        self.enabled_tx.send_replace(enabled);
    }

    fn accept_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        if !self.bridge.enabled() {
            self.bridge.record_refused();
            listener::refuse(stream, peer);
            return;
        }

        let options = ConnectionOptions {
            write_queue_capacity: self.config.write_queue_capacity,
            read_chunk_size: self.config.read_chunk_size,
        };
        let conn = TcpConnection::spawn(stream, peer, self.events_tx.clone(), options);
        self.bridge.accept(conn);
    }

    fn status(&self) -> BridgeStatus {
        BridgeStatus {
            enabled: self.bridge.enabled(),
            connections: self.bridge.connection_count(),
            pending_frames: self.bridge.pending_frames(),
            listening: self.listener.local_addr(),
            metrics: self.bridge.metrics(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DiscardSink;
    use serde_json::json;

    fn server() -> (PluginServer, BridgeHandle) {
        PluginServer::new(BridgeConfig::default(), Arc::new(DiscardSink))
    }

    #[tokio::test]
    async fn test_commands_apply_in_order() {
        let (server, handle) = server();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        handle.set_enabled(true).unwrap();
        handle.register_frame(json!({"n": 1})).unwrap();
        handle.register_frame(json!({"n": 2})).unwrap();

        let status = handle.status().await.unwrap();
        assert!(status.enabled);
        assert!(handle.enabled());
        assert_eq!(status.pending_frames, 2);
        assert_eq!(status.listening, None);

        handle.set_enabled(false).unwrap();
        let status = handle.status().await.unwrap();
        assert_eq!(status.pending_frames, 0);
        assert_eq!(status.metrics.frames_registered, 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_enabled_flag_is_applied_on_run() {
        let config = BridgeConfig {
            enabled: true,
            ..BridgeConfig::default()
        };
        let (server, handle) = PluginServer::new(config, Arc::new(DiscardSink));
        let mut enabled = handle.subscribe_enabled();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        enabled.changed().await.unwrap();
        assert!(*enabled.borrow());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_configured_frame_cap_is_reported() {
        let config = BridgeConfig {
            enabled: true,
            max_pending_frames: Some(1),
            ..BridgeConfig::default()
        };
        let (server, handle) = PluginServer::new(config, Arc::new(DiscardSink));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(server.run(shutdown.clone()));

        for n in 0..3 {
            handle.register_frame(json!({ "n": n })).unwrap();
        }
        let status = handle.status().await.unwrap();
        assert_eq!(status.pending_frames, 1);
        assert_eq!(status.metrics.frames_registered, 3);
        assert_eq!(status.metrics.frames_dropped, 2);

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_reports_a_stopped_server() {
        let (server, handle) = server();
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        server.run(shutdown).await;

        assert!(matches!(handle.on_tick(), Err(BridgeError::ServerGone)));
        assert!(matches!(handle.status().await, Err(BridgeError::ServerGone)));
    }
}

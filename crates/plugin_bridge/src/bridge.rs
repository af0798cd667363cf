//! Bridge state: connections, pending frames, and the enabled flag.
//!
//! [`PluginBridge`] is plain synchronous state. It is owned and driven by the
//! reactor in [`crate::server`], which serializes every call, so nothing here
//! takes a lock. Each public method corresponds to one event the reactor
//! receives: a frame produced, a tick, a raw device chunk, bytes from a plugin,
//! a connection ending, or an enable/disable request.

use std::sync::Arc;

use bridge_types::{Frame, SharedFrame};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::aggregator::FrameAggregator;
use crate::connection::{Connection, ConnectionEvent, ConnectionId};
use crate::error::SendError;
use crate::registry::{CloseMode, ConnectionRegistry};
use crate::sink::DeviceSink;
use crate::wire::{self, FrameEntry};

/// Why a connection left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The plugin closed its end.
    Closed,
    /// Transport error, including a failed write.
    Errored(String),
}

/// Counters describing bridge activity since startup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeMetrics {
    pub frames_registered: u64,
    pub frames_broadcast: u64,
    /// Frames evicted by the pending queue cap before they were broadcast
    pub frames_dropped: u64,
    pub broadcasts: u64,
    pub raw_chunks_relayed: u64,
    /// Lines handed to a connection
    pub deliveries: u64,
    /// Lines skipped because a connection was not writable
    pub skipped_writes: u64,
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub connections_dropped: u64,
    pub bytes_written_back: u64,
}

/// Result of writing one line to every registered connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
}

/// What a broadcast tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Disabled,
    NothingPending,
    /// Frames are kept for the next tick.
    NoConnections { pending: usize },
    /// Every pending frame failed to serialize; the batch was discarded.
    NothingSent,
    Broadcast { frames: usize, report: FanOutReport },
}

pub struct PluginBridge {
    enabled: bool,
    registry: ConnectionRegistry,
    frames: FrameAggregator,
    sink: Arc<dyn DeviceSink>,
    metrics: BridgeMetrics,
}

impl PluginBridge {
    pub fn new(sink: Arc<dyn DeviceSink>, max_pending_frames: Option<usize>) -> Self {
        Self {
            enabled: false,
            registry: ConnectionRegistry::new(),
            frames: FrameAggregator::new(max_pending_frames),
            sink,
            metrics: BridgeMetrics::default(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn pending_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn metrics(&self) -> BridgeMetrics {
        self.metrics
    }

    /// Enables or disables the bridge.
    ///
    /// Disabling aborts every connection. Either way the pending frames are
    /// discarded: a new enabled period always starts from an empty queue.
    pub fn set_enabled(&mut self, enabled: bool) {
        let was_enabled = self.enabled;
        self.enabled = enabled;

        if !enabled {
            let closed = self.registry.close_all(CloseMode::Abort);
            if closed > 0 {
                self.metrics.connections_dropped += closed as u64;
                info!(connections = closed, "Plugin bridge disabled, connections aborted");
            }
        }

        let discarded = self.frames.clear();
        if discarded > 0 {
            debug!(frames = discarded, "Discarded pending frames");
        }

        if was_enabled != enabled {
            info!(enabled, "Plugin bridge state changed");
        }
    }

    /// Takes ownership of a freshly accepted connection.
    ///
    /// The caller refuses connections while disabled, see [`PluginBridge::record_refused`].
    pub fn accept(&mut self, conn: Arc<dyn Connection>) {
        debug_assert!(self.enabled, "connections are refused while the bridge is disabled");

        info!(
            connection = %conn.id(),
            peer = ?conn.peer(),
            total = self.registry.len() + 1,
            "Plugin connected"
        );
        self.metrics.connections_accepted += 1;
        self.registry.add(conn);
    }

    /// Counts a connection turned away before a `Connection` was built for it.
    pub fn record_refused(&mut self) {
        self.metrics.connections_refused += 1;
    }

    pub fn register_frame(&mut self, frame: SharedFrame) {
        if !self.enabled {
            return;
        }
        self.frames.push(frame);
        self.metrics.frames_registered += 1;
        self.metrics.frames_dropped = self.frames.dropped();
    }

    /// Broadcasts every pending frame as a single line.
    pub fn on_tick(&mut self) -> TickOutcome {
        if !self.enabled {
            return TickOutcome::Disabled;
        }
        if self.frames.is_empty() {
            return TickOutcome::NothingPending;
        }
        if self.registry.is_empty() {
            return TickOutcome::NoConnections {
                pending: self.frames.len(),
            };
        }

        let batch = self.frames.take();
        let mut entries = Vec::with_capacity(batch.len());
        for frame in &batch {
            match frame.to_payload() {
                Ok(data) => entries.push(FrameEntry { data }),
                Err(e) => warn!("Skipping frame that failed to serialize: {}", e),
            }
        }

        if entries.is_empty() {
            return TickOutcome::NothingSent;
        }
        let line = match wire::encode_frames(&entries) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode frame broadcast: {}", e);
                return TickOutcome::NothingSent;
            }
        };

        let report = self.fan_out(line);
        self.metrics.broadcasts += 1;
        self.metrics.frames_broadcast += entries.len() as u64;
        trace!(frames = entries.len(), delivered = report.delivered, "Frame broadcast complete");

        TickOutcome::Broadcast {
            frames: entries.len(),
            report,
        }
    }

    /// Relays a raw device chunk to every connection right away.
    pub fn on_raw_bytes(&mut self, bytes: &[u8]) -> Option<FanOutReport> {
        if !self.enabled || self.registry.is_empty() {
            return None;
        }

        let report = self.fan_out(wire::encode_raw(bytes));
        self.metrics.raw_chunks_relayed += 1;
        Some(report)
    }

    /// Applies a notification from one of the connection tasks.
    pub fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Data { id, bytes } => self.on_plugin_data(id, bytes),
            ConnectionEvent::Closed { id } => self.remove(id, DisconnectReason::Closed),
            ConnectionEvent::Errored { id, error } => {
                self.remove(id, DisconnectReason::Errored(error))
            }
        }
    }

    /// Forwards plugin bytes to the device, verbatim.
    fn on_plugin_data(&mut self, id: ConnectionId, bytes: Bytes) {
        if !self.enabled || !self.registry.contains(id) {
            trace!(connection = %id, bytes = bytes.len(), "Discarding plugin data");
            return;
        }

        self.metrics.bytes_written_back += bytes.len() as u64;
        self.sink.write_back(bytes);
    }

    /// Removes a connection and releases its socket. Unknown ids are ignored.
    pub fn remove(&mut self, id: ConnectionId, reason: DisconnectReason) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        conn.abort();
        self.metrics.connections_dropped += 1;

        match reason {
            DisconnectReason::Closed => {
                info!(connection = %id, remaining = self.registry.len(), "Plugin disconnected")
            }
            DisconnectReason::Errored(error) => {
                warn!(connection = %id, remaining = self.registry.len(), "Plugin connection error: {}", error)
            }
        }
    }

    /// Gracefully closes every connection; used when the server stops.
    pub fn shutdown(&mut self) {
        let closed = self.registry.close_all(CloseMode::Graceful);
        self.frames.clear();
        if closed > 0 {
            info!(connections = closed, "Closed plugin connections for shutdown");
        }
    }

    /// Writes one line to a snapshot of the registry.
    ///
    /// Connections found dead are removed only after the pass completes.
    fn fan_out(&mut self, line: Bytes) -> FanOutReport {
        let mut report = FanOutReport::default();
        let mut dead = Vec::new();

        self.registry.for_each(|conn| match conn.try_send(line.clone()) {
            Ok(()) => report.delivered += 1,
            Err(SendError::Full) => {
                debug!(connection = %conn.id(), "Connection not writable, skipping line");
                report.skipped += 1;
            }
            Err(SendError::Closed) => dead.push(conn.id()),
        });

        for id in dead {
            self.remove(id, DisconnectReason::Errored("write to closed connection".to_string()));
            report.dropped += 1;
        }

        self.metrics.deliveries += report.delivered as u64;
        self.metrics.skipped_writes += report.skipped as u64;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{MockBehavior, MockConnection};
    use serde::ser::{Error as _, Serializer};
    use serde_json::json;

    fn bridge() -> (PluginBridge, flume::Receiver<Bytes>) {
        let (tx, rx) = flume::unbounded();
        let mut bridge = PluginBridge::new(Arc::new(tx), None);
        bridge.set_enabled(true);
        (bridge, rx)
    }

    fn frame(value: serde_json::Value) -> SharedFrame {
        Arc::new(value)
    }

    #[derive(Debug)]
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("not today"))
        }
    }

    #[test]
    fn test_two_frames_one_line_to_every_connection() {
        let (mut bridge, _rx) = bridge();
        let a = MockConnection::new();
        let b = MockConnection::new();
        bridge.accept(a.clone());
        bridge.accept(b.clone());

        bridge.register_frame(frame(json!({"f": 1})));
        bridge.register_frame(frame(json!({"f": 2})));
        let outcome = bridge.on_tick();

        let expected = "{\"frames\":[{\"data\":{\"f\":1}},{\"data\":{\"f\":2}}]}\n";
        assert_eq!(a.lines(), vec![expected]);
        assert_eq!(b.lines(), vec![expected]);
        assert_eq!(bridge.pending_frames(), 0);
        assert!(matches!(outcome, TickOutcome::Broadcast { frames: 2, .. }));
    }

    #[test]
    fn test_frames_wait_for_a_connection() {
        let (mut bridge, _rx) = bridge();
        bridge.register_frame(frame(json!(1)));

        assert_eq!(bridge.on_tick(), TickOutcome::NoConnections { pending: 1 });
        assert_eq!(bridge.pending_frames(), 1);

        let a = MockConnection::new();
        bridge.accept(a.clone());
        bridge.register_frame(frame(json!(2)));
        bridge.on_tick();

        assert_eq!(a.lines(), vec!["{\"frames\":[{\"data\":1},{\"data\":2}]}\n"]);
        assert_eq!(bridge.pending_frames(), 0);
        assert_eq!(bridge.on_tick(), TickOutcome::NothingPending);
    }

    #[test]
    fn test_disabled_bridge_ignores_everything() {
        let (tx, rx) = flume::unbounded();
        let mut bridge = PluginBridge::new(Arc::new(tx), None);
        let a = MockConnection::new();

        bridge.record_refused();

        bridge.register_frame(frame(json!(1)));
        assert_eq!(bridge.pending_frames(), 0);
        assert_eq!(bridge.on_tick(), TickOutcome::Disabled);
        assert_eq!(bridge.on_raw_bytes(b"x"), None);

        bridge.handle_connection_event(ConnectionEvent::Data {
            id: a.id(),
            bytes: Bytes::from_static(b"x"),
        });
        assert!(rx.try_recv().is_err());
        assert_eq!(bridge.metrics().connections_refused, 1);
        assert_eq!(bridge.connection_count(), 0);
    }

    #[test]
    fn test_frame_cap_keeps_the_newest_frames() {
        let (tx, _rx) = flume::unbounded();
        let mut bridge = PluginBridge::new(Arc::new(tx), Some(2));
        bridge.set_enabled(true);
        let a = MockConnection::new();
        bridge.accept(a.clone());

        for n in 0..4 {
            bridge.register_frame(frame(json!(n)));
        }
        assert_eq!(bridge.pending_frames(), 2);
        bridge.on_tick();

        assert_eq!(a.lines(), vec!["{\"frames\":[{\"data\":2},{\"data\":3}]}\n"]);
        assert_eq!(bridge.metrics().frames_registered, 4);
        assert_eq!(bridge.metrics().frames_dropped, 2);
        assert_eq!(bridge.metrics().frames_broadcast, 2);
    }

    #[test]
    fn test_batch_that_fails_to_serialize_is_not_a_broadcast() {
        let (mut bridge, _rx) = bridge();
        let a = MockConnection::new();
        bridge.accept(a.clone());

        bridge.register_frame(Arc::new(Unserializable));
        assert_eq!(bridge.on_tick(), TickOutcome::NothingSent);

        assert!(a.lines().is_empty());
        assert_eq!(bridge.pending_frames(), 0);
        assert_eq!(bridge.metrics().broadcasts, 0);
        assert_eq!(bridge.metrics().deliveries, 0);
    }

    #[test]
    fn test_disable_drops_connections_and_frames_for_good() {
        let (mut bridge, _rx) = bridge();
        let a = MockConnection::new();
        let b = MockConnection::new();
        bridge.accept(a.clone());
        bridge.accept(b.clone());
        for n in 0..3 {
            bridge.register_frame(frame(json!(n)));
        }

        bridge.set_enabled(false);
        assert!(a.is_aborted());
        assert!(b.is_aborted());
        assert_eq!(bridge.connection_count(), 0);
        assert_eq!(bridge.pending_frames(), 0);

        bridge.set_enabled(true);
        let c = MockConnection::new();
        let d = MockConnection::new();
        bridge.accept(c.clone());
        bridge.accept(d.clone());
        assert_eq!(bridge.on_tick(), TickOutcome::NothingPending);

        assert!(a.lines().is_empty());
        assert!(c.lines().is_empty());
        assert!(d.lines().is_empty());
    }

    #[test]
    fn test_raw_bytes_relayed_immediately() {
        let (mut bridge, _rx) = bridge();
        assert_eq!(bridge.on_raw_bytes(&[0x41, 0x42]), None);

        let a = MockConnection::new();
        let b = MockConnection::new();
        bridge.accept(a.clone());
        bridge.accept(b.clone());

        let report = bridge.on_raw_bytes(&[0x41, 0x42]).unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(a.lines(), vec!["{\"data\":\"QUI=\"}\n"]);
        assert_eq!(b.lines(), vec!["{\"data\":\"QUI=\"}\n"]);
        assert_eq!(bridge.metrics().raw_chunks_relayed, 1);
    }

    #[test]
    fn test_dead_connection_does_not_stop_fan_out() {
        let (mut bridge, _rx) = bridge();
        let a = MockConnection::new();
        let broken = MockConnection::with_behavior(MockBehavior::Fail(SendError::Closed));
        let c = MockConnection::new();
        bridge.accept(a.clone());
        bridge.accept(broken.clone());
        bridge.accept(c.clone());

        let report = bridge.on_raw_bytes(b"hi").unwrap();

        assert_eq!(report, FanOutReport { delivered: 2, skipped: 0, dropped: 1 });
        assert_eq!(a.lines().len(), 1);
        assert_eq!(c.lines().len(), 1);
        assert!(broken.is_aborted());
        assert_eq!(bridge.connection_count(), 2);
    }

    #[test]
    fn test_unwritable_connection_is_skipped_not_dropped() {
        let (mut bridge, _rx) = bridge();
        let slow = MockConnection::with_behavior(MockBehavior::Fail(SendError::Full));
        bridge.accept(slow.clone());

        let report = bridge.on_raw_bytes(b"one").unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(bridge.connection_count(), 1);

        slow.set_behavior(MockBehavior::Accept);
        bridge.on_raw_bytes(b"two").unwrap();
        assert_eq!(slow.lines(), vec!["{\"data\":\"dHdv\"}\n"]);
    }

    #[test]
    fn test_plugin_data_goes_to_the_device_only() {
        let (mut bridge, rx) = bridge();
        let a = MockConnection::new();
        let b = MockConnection::new();
        bridge.accept(a.clone());
        bridge.accept(b.clone());

        bridge.handle_connection_event(ConnectionEvent::Data {
            id: a.id(),
            bytes: Bytes::from_static(b"\x00AT+RST\r\n"),
        });

        assert_eq!(&rx.try_recv().unwrap()[..], b"\x00AT+RST\r\n");
        assert!(a.lines().is_empty());
        assert!(b.lines().is_empty());
        assert_eq!(bridge.metrics().bytes_written_back, 9);
    }

    #[test]
    fn test_close_and_error_events_remove_once() {
        let (mut bridge, _rx) = bridge();
        let a = MockConnection::new();
        bridge.accept(a.clone());

        bridge.handle_connection_event(ConnectionEvent::Errored {
            id: a.id(),
            error: "connection reset".to_string(),
        });
        bridge.handle_connection_event(ConnectionEvent::Closed { id: a.id() });

        assert_eq!(bridge.connection_count(), 0);
        assert_eq!(bridge.metrics().connections_dropped, 1);
    }

    #[test]
    fn test_unserializable_frame_is_skipped() {
        let (mut bridge, _rx) = bridge();
        let a = MockConnection::new();
        bridge.accept(a.clone());

        bridge.register_frame(Arc::new(Unserializable));
        bridge.register_frame(frame(json!("ok")));
        let outcome = bridge.on_tick();

        assert!(matches!(outcome, TickOutcome::Broadcast { frames: 1, .. }));
        assert_eq!(a.lines(), vec!["{\"frames\":[{\"data\":\"ok\"}]}\n"]);
        assert_eq!(bridge.pending_frames(), 0);
    }

    #[test]
    fn test_shutdown_closes_gracefully() {
        let (mut bridge, _rx) = bridge();
        let a = MockConnection::new();
        bridge.accept(a.clone());

        bridge.shutdown();
        assert!(a.is_closed());
        assert!(!a.is_aborted());
        assert_eq!(bridge.connection_count(), 0);
    }
}

//! Plugin connections.
//!
//! A [`Connection`] is the capability set the bridge needs from an accepted
//! client: push a line without blocking, close it gracefully, or abort it.
//! Inbound traffic and lifecycle changes travel the other way as
//! [`ConnectionEvent`]s on a channel owned by the reactor, so nothing ever calls
//! back into bridge state from a socket task.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::SendError;

/// Unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Notifications flowing from a connection's I/O tasks to the reactor.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Bytes sent by the plugin.
    Data { id: ConnectionId, bytes: Bytes },
    /// The plugin closed its end.
    Closed { id: ConnectionId },
    /// The transport failed (reset, broken pipe, ...).
    Errored { id: ConnectionId, error: String },
}

/// An accepted plugin connection, as seen by the registry and dispatcher.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Remote address, for logging.
    fn peer(&self) -> Option<SocketAddr>;

    /// Queues `line` for delivery without waiting.
    ///
    /// `SendError::Full` means the line was skipped; `SendError::Closed` means the
    /// connection is dead.
    fn try_send(&self, line: Bytes) -> Result<(), SendError>;

    /// Flushes whatever is already queued, then shuts the socket down.
    fn close(&self);

    /// Drops the socket immediately, discarding queued lines.
    fn abort(&self);
}

/// Tuning for a spawned TCP connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
    pub write_queue_capacity: usize,
    pub read_chunk_size: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            write_queue_capacity: 64,
            read_chunk_size: 4096,
        }
    }
}

/// A plugin connection over a tokio `TcpStream`.
///
/// The stream is split into a reader task, which forwards everything the plugin
/// sends as [`ConnectionEvent::Data`], and a writer task draining a bounded
/// outbound queue. Both tasks end when the connection is closed or aborted, which
/// releases the socket.
pub struct TcpConnection {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    closing: CancellationToken,
    aborted: CancellationToken,
}

impl TcpConnection {
    pub fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        events: flume::Sender<ConnectionEvent>,
        options: ConnectionOptions,
    ) -> Arc<Self> {
        let id = ConnectionId::new();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection = %id, "Failed to set TCP_NODELAY: {}", e);
        }

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(options.write_queue_capacity.max(1));
        let closing = CancellationToken::new();
        let aborted = CancellationToken::new();

        tokio::spawn(read_loop(
            id,
            reader,
            events.clone(),
            options.read_chunk_size.max(1),
            closing.clone(),
            aborted.clone(),
        ));
        tokio::spawn(write_loop(
            id,
            writer,
            outbound_rx,
            events,
            closing.clone(),
            aborted.clone(),
        ));

        Arc::new(Self {
            id,
            peer,
            outbound,
            closing,
            aborted,
        })
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn try_send(&self, line: Bytes) -> Result<(), SendError> {
        if self.closing.is_cancelled() || self.aborted.is_cancelled() {
            return Err(SendError::Closed);
        }
        self.outbound.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    fn close(&self) {
        self.closing.cancel();
    }

    fn abort(&self) {
        self.aborted.cancel();
    }
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    events: flume::Sender<ConnectionEvent>,
    chunk_size: usize,
    closing: CancellationToken,
    aborted: CancellationToken,
) {
    let mut buffer = BytesMut::with_capacity(chunk_size);
    loop {
        buffer.reserve(chunk_size);
        let event = tokio::select! {
            biased;
            _ = aborted.cancelled() => return,
            _ = closing.cancelled() => return,
            result = reader.read_buf(&mut buffer) => match result {
                Ok(0) => ConnectionEvent::Closed { id },
                Ok(n) => {
                    trace!(connection = %id, bytes = n, "Read from plugin");
                    ConnectionEvent::Data { id, bytes: buffer.split().freeze() }
                }
                Err(e) => ConnectionEvent::Errored { id, error: e.to_string() },
            }
        };

        let finished = !matches!(event, ConnectionEvent::Data { .. });
        if events.send(event).is_err() || finished {
            return;
        }
    }
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    events: flume::Sender<ConnectionEvent>,
    closing: CancellationToken,
    aborted: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = aborted.cancelled() => return,
            _ = closing.cancelled() => {
                while let Ok(line) = outbound.try_recv() {
                    if writer.write_all(&line).await.is_err() {
                        return;
                    }
                }
                let _ = writer.shutdown().await;
                debug!(connection = %id, "Connection closed gracefully");
                return;
            }
            line = outbound.recv() => match line {
                Some(line) => line,
                // Every sender is gone, the connection object was dropped.
                None => return,
            }
        };

        let result = tokio::select! {
            biased;
            _ = aborted.cancelled() => return,
            result = writer.write_all(&line) => result,
        };
        if let Err(e) = result {
            let _ = events.send(ConnectionEvent::Errored {
                id,
                error: e.to_string(),
            });
            return;
        }
    }
}

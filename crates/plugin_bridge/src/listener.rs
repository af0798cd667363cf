//! Listening socket for plugin connections.

use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use crate::error::{BridgeError, BridgeResult};

/// Proof that the listener is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listening {
    pub local_addr: SocketAddr,
}

/// Owns the listening socket. While stopped, `accept` never resolves.
#[derive(Debug, Default)]
pub struct Listener {
    socket: Option<TcpListener>,
}

impl Listener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `addr`, replacing any socket bound earlier.
    pub async fn start(&mut self, addr: SocketAddr) -> BridgeResult<Listening> {
        self.stop();

        let socket = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, "Plugin server listening");

        self.socket = Some(socket);
        Ok(Listening { local_addr })
    }

    /// Releases the listening socket. Calling it again is a no-op.
    pub fn stop(&mut self) {
        if let Some(socket) = self.socket.take() {
            info!(addr = ?socket.local_addr().ok(), "Plugin server stopped listening");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Waits for the next inbound connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.socket {
            Some(socket) => socket.accept().await,
            None => std::future::pending().await,
        }
    }
}

/// Closes a connection the bridge will not serve, instead of leaving it pending.
pub fn refuse(mut stream: TcpStream, peer: SocketAddr) {
    debug!(peer = %peer, "Refusing plugin connection while bridge is disabled");
    tokio::spawn(async move {
        let _ = stream.shutdown().await;
    });
}

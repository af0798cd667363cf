//! Error types for the plugin bridge

use std::net::SocketAddr;

use thiserror::Error;

/// Bridge-level errors surfaced to the host application
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("unable to start plugin TCP server on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("plugin bridge server is no longer running")]
    ServerGone,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Why a single line could not be handed to a connection.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The connection's outbound buffer is full; this line is skipped.
    #[error("connection not writable, line skipped")]
    Full,
    /// The connection is gone and should be removed.
    #[error("connection closed")]
    Closed,
}

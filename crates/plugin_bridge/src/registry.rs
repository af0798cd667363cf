//! Registry of live plugin connections.

use std::sync::Arc;

use tracing::debug;

use crate::connection::{Connection, ConnectionId};

/// How `close_all` releases connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Flush queued lines first (server shutdown).
    Graceful,
    /// Drop sockets immediately (bridge disabled).
    Abort,
}

/// Tracks every accepted connection in accept order.
///
/// Iteration always goes through a snapshot of the membership, so a connection
/// removed while a fan-out is in flight cannot disturb delivery to the others.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Vec<Arc<dyn Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, conn: Arc<dyn Connection>) {
        if self.contains(conn.id()) {
            return;
        }
        debug!(connection = %conn.id(), total = self.connections.len() + 1, "Connection registered");
        self.connections.push(conn);
    }

    /// Removes a connection. Removing an unknown id is a no-op.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        let index = self.connections.iter().position(|c| c.id() == id)?;
        let removed = self.connections.remove(index);
        debug!(connection = %id, remaining = self.connections.len(), "Connection unregistered");
        Some(removed)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.iter().any(|c| c.id() == id)
    }

    /// Copy of the current membership.
    pub fn snapshot(&self) -> Vec<Arc<dyn Connection>> {
        self.connections.clone()
    }

    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<dyn Connection>),
    {
        for conn in self.snapshot().iter() {
            f(conn);
        }
    }

    /// Closes and forgets every connection, returning how many there were.
    pub fn close_all(&mut self, mode: CloseMode) -> usize {
        let closed = self.connections.len();
        for conn in self.connections.drain(..) {
            match mode {
                CloseMode::Graceful => conn.close(),
                CloseMode::Abort => conn.abort(),
            }
        }
        self.connections.shrink_to_fit();
        closed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

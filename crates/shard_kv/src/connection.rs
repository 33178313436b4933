//! Caller identities passed through command execution.

use std::net::SocketAddr;

/// What command execution needs to know about its caller.
///
/// The selected database index is the only state that crosses node
/// boundaries: relays re-issue `SELECT` on the peer before forwarding.
pub trait Connection: Send + Sync {
    fn db_index(&self) -> usize;

    fn select_db(&mut self, index: usize);

    /// Remote address for real client sessions.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Session state for a client attached to the Redis listener.
#[derive(Debug, Clone)]
pub struct ClientConnection {
    addr: SocketAddr,
    db_index: usize,
}

impl ClientConnection {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr, db_index: 0 }
    }
}

impl Connection for ClientConnection {
    fn db_index(&self) -> usize {
        self.db_index
    }

    fn select_db(&mut self, index: usize) {
        self.db_index = index;
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }
}

/// Caller used while replaying the AOF. It only tracks the database index so
/// persisted `SELECT` entries steer the commands that follow them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayConnection {
    db_index: usize,
}

impl Connection for ReplayConnection {
    fn db_index(&self) -> usize {
        self.db_index
    }

    fn select_db(&mut self, index: usize) {
        self.db_index = index;
    }
}

//! Process-wide registry of logged-in users.
//!
//! Entries are added on login and removed when the owning connection ends.
//! Every method takes the lock internally; callers never see it.

use crate::protocol::Frame;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

/// Outbound half of a connection: frames pushed here are written in order by
/// that connection's writer task.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    conn_id: u64,
    tx: mpsc::Sender<Frame>,
}

impl PeerHandle {
    pub fn new(conn_id: u64, tx: mpsc::Sender<Frame>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Queue a frame for the peer without waiting.
    ///
    /// Returns false if the peer's queue is full or its connection is gone;
    /// callers treat both as offline and leave the message queued.
    pub fn send(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                debug!(conn = self.conn_id, kind = ?frame.kind, "peer queue full");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    online: RwLock<HashMap<String, PeerHandle>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `user`, replacing (and returning) any earlier session.
    pub fn insert(&self, user: &str, handle: PeerHandle) -> Option<PeerHandle> {
        self.online.write().insert(user.to_string(), handle)
    }

    /// Remove `user` only if the entry still belongs to `conn_id`.
    pub fn remove_if_owner(&self, user: &str, conn_id: u64) -> bool {
        let mut online = self.online.write();
        match online.get(user) {
            Some(handle) if handle.conn_id == conn_id => {
                online.remove(user);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, user: &str) -> Option<PeerHandle> {
        self.online.read().get(user).cloned()
    }

    pub fn len(&self) -> usize {
        self.online.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.read().is_empty()
    }
}

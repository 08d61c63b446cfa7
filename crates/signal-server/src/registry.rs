//! Peer registry for the signal server

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};

use signal_core::HandshakeError;

use crate::error::ConnectionError;
use crate::session::SessionId;

/// Frames queued for a connection's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
}

/// Cloneable handle used to reach a connection from any task
#[derive(Debug, Clone)]
pub struct PeerHandle {
    tx: mpsc::Sender<Outbound>,
    close_tx: Arc<watch::Sender<bool>>,
}

/// Receiving side of a [`PeerHandle`], owned by the connection task
pub struct PeerChannels {
    pub outbound: mpsc::Receiver<Outbound>,
    pub closed: watch::Receiver<bool>,
}

impl PeerHandle {
    /// Create a handle with an outbound queue of `depth` frames
    pub fn channel(depth: usize) -> (Self, PeerChannels) {
        let (tx, outbound) = mpsc::channel(depth.max(1));
        let (close_tx, closed) = watch::channel(false);
        let handle = Self {
            tx,
            close_tx: Arc::new(close_tx),
        };
        (handle, PeerChannels { outbound, closed })
    }

    /// Queue a text frame, waiting for queue capacity
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.tx
            .send(Outbound::Text(text.into()))
            .await
            .map_err(|_| ConnectionError::QueueClosed)
    }

    /// Queue a text frame without waiting
    pub fn try_send_text(&self, text: impl Into<String>) -> Result<(), ConnectionError> {
        self.tx
            .try_send(Outbound::Text(text.into()))
            .map_err(|_| ConnectionError::QueueClosed)
    }

    /// Reserve one slot in the outbound queue
    pub async fn reserve(&self) -> Result<mpsc::Permit<'_, Outbound>, ConnectionError> {
        self.tx.reserve().await.map_err(|_| ConnectionError::QueueClosed)
    }

    /// Queue a liveness ping
    pub async fn ping(&self) -> Result<(), ConnectionError> {
        self.tx
            .send(Outbound::Ping)
            .await
            .map_err(|_| ConnectionError::QueueClosed)
    }

    /// Ask the connection to close. Safe to call repeatedly.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Whether a close was requested or the writer has gone away
    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow() || self.tx.is_closed()
    }
}

/// Resolve once `closed` flips to true (or its sender is gone)
pub async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Pairing status of a registered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Idle,
    InSession(SessionId),
}

/// A registered peer
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub handle: PeerHandle,
    pub addr: SocketAddr,
    /// Identifies the connection that registered this uid
    pub connection_id: String,
    pub status: PeerStatus,
    pub connected_at: Instant,
}

impl PeerEntry {
    pub fn new(handle: PeerHandle, addr: SocketAddr, connection_id: impl Into<String>) -> Self {
        Self {
            handle,
            addr,
            connection_id: connection_id.into(),
            status: PeerStatus::Idle,
            connected_at: Instant::now(),
        }
    }
}

/// Map from uid to connected peer.
///
/// Not synchronized on its own; [`crate::state::SignalState`] guards it.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer, failing if the uid is taken
    pub fn register(&mut self, uid: &str, entry: PeerEntry) -> Result<(), HandshakeError> {
        if self.peers.contains_key(uid) {
            return Err(HandshakeError::DuplicatePeer(uid.to_string()));
        }
        self.peers.insert(uid.to_string(), entry);
        Ok(())
    }

    /// Connection handle for `uid`
    pub fn lookup(&self, uid: &str) -> Option<PeerHandle> {
        self.peers.get(uid).map(|p| p.handle.clone())
    }

    pub fn get(&self, uid: &str) -> Option<&PeerEntry> {
        self.peers.get(uid)
    }

    pub fn get_mut(&mut self, uid: &str) -> Option<&mut PeerEntry> {
        self.peers.get_mut(uid)
    }

    /// Remove `uid`. Absent uids are a no-op.
    pub(crate) fn remove(&mut self, uid: &str) -> Option<PeerEntry> {
        self.peers.remove(uid)
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.peers.contains_key(uid)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = &PeerHandle> {
        self.peers.values().map(|p| &p.handle)
    }

    pub fn uids(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.peers.clear();
    }
}

//! Shared registry and session state
//!
//! Every connection task goes through [`SignalState`]. Each operation takes
//! the single lock once, checks and mutates within it, and never holds it
//! across an await point. Pairing and teardown are therefore atomic with
//! respect to each other.

use parking_lot::Mutex;
use tokio::sync::mpsc::Permit;
use tracing::{debug, info};

use signal_core::{HandshakeError, PairingError, ServerReply};

use crate::error::ConnectionError;
use crate::registry::{Outbound, PeerEntry, PeerHandle, PeerRegistry, PeerStatus};
use crate::session::{SessionId, SessionTable};

#[derive(Default)]
struct StateInner {
    peers: PeerRegistry,
    sessions: SessionTable,
}

/// Where a frame from a peer should go
#[derive(Debug, Clone)]
pub enum Route {
    /// The peer is idle; the frame is a control command
    Command,
    /// The peer is paired; the frame goes to `partner`
    Relay { partner: String, handle: PeerHandle },
}

/// Result of removing a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Teardown {
    pub uid: String,
    /// Session that ended with the removal, and the partner that was closed
    pub session: Option<(SessionId, String)>,
}

/// Registry and sessions behind one lock
#[derive(Default)]
pub struct SignalState {
    inner: Mutex<StateInner>,
}

impl SignalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly greeted peer as idle
    pub fn register(&self, uid: &str, entry: PeerEntry) -> Result<(), HandshakeError> {
        let mut inner = self.inner.lock();
        inner.peers.register(uid, entry)?;
        info!("Registered peer {} ({} connected)", uid, inner.peers.len());
        Ok(())
    }

    pub fn lookup(&self, uid: &str) -> Option<PeerHandle> {
        self.inner.lock().peers.lookup(uid)
    }

    pub fn status_of(&self, uid: &str) -> Option<PeerStatus> {
        self.inner.lock().peers.get(uid).map(|p| p.status)
    }

    pub fn partner_of(&self, uid: &str) -> Option<String> {
        let inner = self.inner.lock();
        match inner.peers.get(uid)?.status {
            PeerStatus::InSession(id) => inner.sessions.partner_of(id, uid).map(str::to_string),
            PeerStatus::Idle => None,
        }
    }

    /// Pair `caller` with `callee`.
    ///
    /// The reply (`SESSION_OK` or `ERROR ...`) is pushed through `reply`
    /// while the lock is held, so it reaches the caller before any frame the
    /// callee relays. Pairing failures come back as
    /// [`ConnectionError::Rejected`] and leave the state untouched.
    pub fn request_session(
        &self,
        caller: &str,
        callee: &str,
        reply: Permit<'_, Outbound>,
    ) -> Result<SessionId, ConnectionError> {
        let mut inner = self.inner.lock();

        let rejection = match (inner.peers.get(caller), inner.peers.get(callee)) {
            (None, _) => return Err(ConnectionError::NotRegistered(caller.to_string())),
            (_, None) => Some(PairingError::PeerNotFound(callee.to_string())),
            (Some(c), _) if c.status != PeerStatus::Idle => Some(PairingError::AlreadyInSession),
            _ if caller == callee => Some(PairingError::SelfSession),
            (_, Some(c)) if c.status != PeerStatus::Idle => {
                Some(PairingError::PeerBusy(callee.to_string()))
            }
            _ => None,
        };

        if let Some(e) = rejection {
            reply.send(Outbound::Text(ServerReply::from(e.clone()).to_string()));
            return Err(ConnectionError::Rejected(e));
        }

        let id = inner.sessions.open(caller, callee);
        for uid in [caller, callee] {
            if let Some(peer) = inner.peers.get_mut(uid) {
                peer.status = PeerStatus::InSession(id);
            }
        }
        reply.send(Outbound::Text(ServerReply::SessionOk.to_string()));

        info!(
            "Session {} from {} to {} ({} peers, {} sessions)",
            id,
            caller,
            callee,
            inner.peers.len(),
            inner.sessions.len()
        );
        Ok(id)
    }

    /// Decide where the next frame from `uid` goes
    pub fn route(&self, uid: &str) -> Result<Route, ConnectionError> {
        let inner = self.inner.lock();
        let peer = inner
            .peers
            .get(uid)
            .ok_or_else(|| ConnectionError::NotRegistered(uid.to_string()))?;

        match peer.status {
            PeerStatus::Idle => Ok(Route::Command),
            PeerStatus::InSession(id) => {
                let partner = inner
                    .sessions
                    .partner_of(id, uid)
                    .ok_or_else(|| ConnectionError::NotRegistered(uid.to_string()))?;
                let handle = inner
                    .peers
                    .lookup(partner)
                    .ok_or_else(|| ConnectionError::NotRegistered(partner.to_string()))?;
                Ok(Route::Relay {
                    partner: partner.to_string(),
                    handle,
                })
            }
        }
    }

    /// Remove `uid` if it is still owned by `connection_id`.
    ///
    /// If the peer was in a session, the session ends and the partner is
    /// removed and asked to close as well. Returns `None` when there was
    /// nothing to remove.
    pub fn remove_peer(&self, uid: &str, connection_id: &str) -> Option<Teardown> {
        let mut inner = self.inner.lock();

        match inner.peers.get(uid) {
            Some(peer) if peer.connection_id == connection_id => {}
            _ => return None,
        }
        let entry = inner.peers.remove(uid)?;
        entry.handle.close();

        let mut teardown = Teardown {
            uid: uid.to_string(),
            session: None,
        };

        if let PeerStatus::InSession(id) = entry.status {
            if let Some(pair) = inner.sessions.close(id) {
                debug!("Cleaned up session {} after {:?}", id, pair.started_at.elapsed());
                if let Some(partner) = pair.other(uid) {
                    if let Some(other) = inner.peers.remove(partner) {
                        info!("Closing connection to {}", partner);
                        other.handle.close();
                    }
                    teardown.session = Some((id, partner.to_string()));
                }
            }
        }

        info!(
            "Disconnected from peer {} at {} after {:?}",
            uid,
            entry.addr,
            entry.connected_at.elapsed()
        );
        Some(teardown)
    }

    /// Ask every connection to close
    pub fn close_all(&self) {
        let inner = self.inner.lock();
        for handle in inner.peers.handles() {
            handle.close();
        }
    }

    /// Drop every peer and session
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.peers.clear();
        inner.sessions.clear();
    }

    pub fn peer_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Check that statuses and sessions agree: a peer is in a session iff
    /// that session exists and names it, and both members point back at it.
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();

        let sessions_ok = inner.sessions.iter().all(|(id, pair)| {
            let (a, b) = pair.peers();
            [a, b].iter().all(|uid| {
                inner
                    .peers
                    .get(uid)
                    .map_or(false, |p| p.status == PeerStatus::InSession(*id))
            })
        });

        let peers_ok = inner.peers.uids().iter().all(|uid| {
            match inner.peers.get(uid).map(|p| p.status) {
                Some(PeerStatus::InSession(id)) => inner
                    .sessions
                    .get(id)
                    .map_or(false, |pair| pair.contains(uid)),
                _ => true,
            }
        });

        sessions_ok && peers_ok
    }
}

//! Session table
//!
//! A session is stored once, as an unordered pair, so the partner relation
//! is symmetric by construction: each peer finds the other through the same
//! entry.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

/// Identifier of an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// The two uids of a session, in no particular order
#[derive(Debug, Clone)]
pub struct SessionPair {
    peers: [String; 2],
    pub started_at: Instant,
}

impl SessionPair {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            peers: [a.into(), b.into()],
            started_at: Instant::now(),
        }
    }

    /// The partner of `uid`, if `uid` is part of this session
    pub fn other(&self, uid: &str) -> Option<&str> {
        match &self.peers {
            [a, b] if a == uid => Some(b.as_str()),
            [a, b] if b == uid => Some(a.as_str()),
            _ => None,
        }
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.peers.iter().any(|p| p == uid)
    }

    pub fn peers(&self) -> (&str, &str) {
        (&self.peers[0], &self.peers[1])
    }
}

/// All active sessions
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, SessionPair>,
    next_id: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session between `a` and `b`
    pub fn open(&mut self, a: &str, b: &str) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.sessions.insert(id, SessionPair::new(a, b));
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&SessionPair> {
        self.sessions.get(&id)
    }

    /// Partner of `uid` within session `id`
    pub fn partner_of(&self, id: SessionId, uid: &str) -> Option<&str> {
        self.sessions.get(&id).and_then(|s| s.other(uid))
    }

    /// Drop a session. Absent ids are a no-op.
    pub fn close(&mut self, id: SessionId) -> Option<SessionPair> {
        self.sessions.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SessionId, &SessionPair)> {
        self.sessions.iter()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}

//! Server-side error types

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use signal_core::{HandshakeError, PairingError};

/// Errors raised while handling a single connection.
///
/// All but [`ConnectionError::Rejected`] end that connection's handler.
/// None of them reach sibling connections or the accept loop.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// A `SESSION` request was refused; the requester has been told why
    #[error("session request rejected: {0}")]
    Rejected(#[from] PairingError),

    #[error("malformed relay payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer's own registry entry vanished while its handler was running
    #[error("peer {0:?} is no longer registered")]
    NotRegistered(String),

    #[error("outbound queue closed")]
    QueueClosed,
}

/// Errors that end the accept loop
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(std::io::Error),
}

/// Errors that end the supervisor
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("server crashed {restarts} times, giving up: {last}")]
    RestartLimit { restarts: u32, last: ServeError },
}

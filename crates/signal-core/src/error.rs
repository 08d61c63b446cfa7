//! Error types for the signal protocol

use thiserror::Error;

/// WebSocket close code for protocol violations (RFC 6455 section 7.4.1)
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Errors raised while validating the `HELLO` greeting
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("invalid protocol")]
    InvalidProtocol,

    #[error("invalid peer uid")]
    InvalidPeerUid,

    #[error("peer uid {0:?} already registered")]
    DuplicatePeer(String),

    #[error("connection closed before handshake")]
    Closed,
}

impl HandshakeError {
    /// Reason string sent in the close frame
    pub fn close_reason(&self) -> &'static str {
        match self {
            HandshakeError::InvalidProtocol | HandshakeError::Closed => "invalid protocol",
            HandshakeError::InvalidPeerUid | HandshakeError::DuplicatePeer(_) => "invalid peer uid",
        }
    }

    /// Close code sent with the close frame
    pub fn close_code(&self) -> u16 {
        CLOSE_PROTOCOL_ERROR
    }
}

/// Errors answered to a `SESSION` request.
///
/// The `Display` output is the text that follows `ERROR ` on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("peer '{0}' not found")]
    PeerNotFound(String),

    #[error("you are already in a session, reconnect to the server to start a new session, or use a ROOM for multi-peer sessions")]
    AlreadyInSession,

    #[error("peer '{0}' busy")]
    PeerBusy(String),

    #[error("cannot start a session with yourself")]
    SelfSession,
}

/// Configuration errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("No configuration directory available")]
    NoConfigDir,
}

//! Text protocol spoken over the signaling WebSocket
//!
//! Every control message is a single text frame made of a command word and
//! an argument, separated by the first run of whitespace:
//!
//! ```text
//! client -> HELLO <uid>        server -> HELLO
//! client -> SESSION <callee>   server -> SESSION_OK | ERROR <reason>
//! ```
//!
//! Once a session exists, frames are relayed verbatim and never parsed here.

use std::fmt;

use crate::error::{HandshakeError, PairingError};

/// Greeting command word
pub const HELLO: &str = "HELLO";

/// Session request command word
pub const SESSION: &str = "SESSION";

/// Successful pairing reply
pub const SESSION_OK: &str = "SESSION_OK";

/// A control message received from an idle peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    /// `HELLO <uid>`
    Hello { uid: String },
    /// `SESSION <callee>`
    Session { callee: String },
    /// Anything else
    Unknown,
}

impl ClientCommand {
    /// Classify a text frame
    pub fn parse(frame: &str) -> Self {
        let (word, arg) = split_command(frame);
        let arg = arg.unwrap_or_default().to_string();
        match word {
            HELLO => ClientCommand::Hello { uid: arg },
            SESSION => ClientCommand::Session { callee: arg },
            _ => ClientCommand::Unknown,
        }
    }
}

/// Replies produced by the server
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerReply {
    Hello,
    SessionOk,
    Error(PairingError),
}

impl fmt::Display for ServerReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerReply::Hello => f.write_str(HELLO),
            ServerReply::SessionOk => f.write_str(SESSION_OK),
            ServerReply::Error(e) => write!(f, "ERROR {}", e),
        }
    }
}

impl From<PairingError> for ServerReply {
    fn from(e: PairingError) -> Self {
        ServerReply::Error(e)
    }
}

/// Validate the first frame of a connection and extract the peer uid.
///
/// Uniqueness is not checked here; the registry owns that decision.
pub fn validate_hello(frame: &str) -> Result<String, HandshakeError> {
    let (word, uid) = split_command(frame);
    if word != HELLO {
        return Err(HandshakeError::InvalidProtocol);
    }
    match uid {
        Some(uid) if is_valid_uid(uid) => Ok(uid.to_string()),
        _ => Err(HandshakeError::InvalidPeerUid),
    }
}

/// A uid is any non-empty string without whitespace
pub fn is_valid_uid(uid: &str) -> bool {
    !uid.is_empty() && !uid.contains(char::is_whitespace)
}

/// Split off the command word. The argument keeps any trailing whitespace.
fn split_command(frame: &str) -> (&str, Option<&str>) {
    let frame = frame.trim_start();
    match frame.find(char::is_whitespace) {
        Some(idx) => {
            let rest = frame[idx..].trim_start();
            (&frame[..idx], (!rest.is_empty()).then_some(rest))
        }
        None => (frame, None),
    }
}

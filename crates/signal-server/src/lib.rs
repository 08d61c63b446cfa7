//! Signal Relay Server
//!
//! Lightweight signaling relay that lets two clients find each other by a
//! self-chosen uid and exchange negotiation payloads (session descriptions,
//! connectivity candidates) without the server understanding them.
//!
//! # Protocol
//!
//! 1. Client connects over WebSocket and sends `HELLO <uid>`
//! 2. Server registers the uid and answers `HELLO`
//! 3. Caller sends `SESSION <callee>`; server pairs both peers and answers `SESSION_OK`
//! 4. Every later frame from either side is relayed verbatim to the other
//! 5. When one side leaves, the server closes the other side too

pub mod connection;
pub mod error;
pub mod keepalive;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod state;
pub mod supervisor;

pub use error::{ConnectionError, ServeError, SupervisorError};
pub use registry::{PeerHandle, PeerStatus};
pub use server::{ServeExit, ServerOptions, SignalServer, StopHandle};
pub use session::SessionId;
pub use state::SignalState;
pub use supervisor::{RestartPolicy, Supervisor};

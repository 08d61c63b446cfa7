//! Signal Core - Shared protocol vocabulary, errors, and configuration
//!
//! This crate contains the text protocol spoken between clients and the
//! signal relay, the error taxonomy used on the wire, and the configuration
//! system. It has no dependencies on networking code.

pub mod config;
pub mod error;
pub mod protocol;

pub use config::{Config, PayloadPolicy, ServerConfig, SupervisorConfig};
pub use error::*;
pub use protocol::*;

/// Default listen port
pub const DEFAULT_PORT: u16 = 8443;

/// Default keepalive timeout in seconds
pub const DEFAULT_KEEPALIVE_TIMEOUT_SECS: u64 = 30;

/// Default health-check route
pub const DEFAULT_HEALTH_PATH: &str = "/health";

/// Default depth of each connection's outbound queue
pub const DEFAULT_MAX_QUEUE: usize = 16;

/// Maximum inbound frame size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

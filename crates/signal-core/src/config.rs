//! Configuration system for the signal relay
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from an explicit path, or from:
//! - macOS: ~/Library/Application Support/signal-relay/config.toml
//! - Linux: ~/.config/signal-relay/config.toml
//! - Windows: %APPDATA%/signal-relay/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;
use crate::{
    DEFAULT_HEALTH_PATH, DEFAULT_KEEPALIVE_TIMEOUT_SECS, DEFAULT_MAX_QUEUE, DEFAULT_PORT,
    MAX_MESSAGE_SIZE,
};

/// Shortest keepalive interval a config can ask for
const MIN_KEEPALIVE_TIMEOUT_SECS: u64 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener and connection settings
    pub server: ServerConfig,
    /// Restart policy
    pub supervisor: SupervisorConfig,
}

/// What the relay does with a frame that is not a JSON envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadPolicy {
    /// Terminate the sender's connection, which tears the session down
    #[default]
    Disconnect,
    /// Relay the frame verbatim anyway
    Forward,
}

/// Listener and per-connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: IpAddr,
    /// Listen port
    pub port: u16,
    /// Idle time before a keepalive ping is sent
    pub keepalive_timeout_secs: u64,
    /// HTTP route answered with `200 OK` outside the protocol
    pub health_path: String,
    /// Outbound queue depth per connection
    pub max_queue: usize,
    /// Largest accepted frame in bytes
    pub max_message_size: usize,
    /// Handling of unparseable relay frames
    pub malformed_payload: PayloadPolicy,
    /// Time given to open connections to close on shutdown
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            keepalive_timeout_secs: DEFAULT_KEEPALIVE_TIMEOUT_SECS,
            health_path: DEFAULT_HEALTH_PATH.to_string(),
            max_queue: DEFAULT_MAX_QUEUE,
            max_message_size: MAX_MESSAGE_SIZE,
            malformed_payload: PayloadPolicy::Disconnect,
            drain_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Keepalive interval, never below one second
    pub fn keepalive_timeout(&self) -> Duration {
        if self.keepalive_timeout_secs < MIN_KEEPALIVE_TIMEOUT_SECS {
            warn!(
                "keepalive_timeout_secs = {} is too short, using {}",
                self.keepalive_timeout_secs, MIN_KEEPALIVE_TIMEOUT_SECS
            );
        }
        Duration::from_secs(self.keepalive_timeout_secs.max(MIN_KEEPALIVE_TIMEOUT_SECS))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Restart policy for the serve loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Crash restarts allowed before giving up (0 = unlimited)
    pub max_restarts: u32,
    /// Delay before restarting after a crash
    pub restart_backoff_ms: u64,
    /// Start a fresh server after an explicit stop
    pub restart_on_stop: bool,
    /// An instance that served this long before crashing starts a new count
    pub restart_reset_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            restart_backoff_ms: 500,
            restart_on_stop: true,
            restart_reset_secs: 60,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    pub fn restart_reset(&self) -> Duration {
        Duration::from_secs(self.restart_reset_secs)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_or_default(&path),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load from `path`, falling back to defaults when it cannot be read
    pub fn load_or_default(path: &Path) -> Self {
        Self::load_from(path).unwrap_or_else(|e| {
            warn!("Failed to load config from {:?}: {}, using defaults", path, e);
            Self::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "signal-relay", "signal-relay")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

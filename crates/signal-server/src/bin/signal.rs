//! Signal Relay Server
//!
//! WebSocket signaling relay that pairs peers by uid and forwards their
//! negotiation messages.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:8443, 30s keepalive, /health
//! signal-relay
//!
//! # Explicit settings
//! signal-relay --addr 127.0.0.1 --port 9000 --keepalive-timeout 10 --health /healthz
//!
//! # With a config file
//! signal-relay --config /etc/signal-relay/config.toml
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use signal_core::Config;
use signal_server::{RestartPolicy, ServerOptions, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "signal-relay")]
#[command(about = "WebSocket signaling relay for peer-to-peer session negotiation")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "SIGNAL_RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (default: all interfaces)
    #[arg(short, long, env = "SIGNAL_RELAY_ADDR")]
    addr: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "SIGNAL_RELAY_PORT")]
    port: Option<u16>,

    /// Timeout for keepalive (in seconds)
    #[arg(long, env = "SIGNAL_RELAY_KEEPALIVE_TIMEOUT")]
    keepalive_timeout: Option<u64>,

    /// Health check route
    #[arg(long, env = "SIGNAL_RELAY_HEALTH")]
    health: Option<String>,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = match &self.config {
            Some(path) => Config::load_or_default(path),
            None => Config::load(),
        };

        if let Some(addr) = self.addr {
            config.server.bind = addr;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(secs) = self.keepalive_timeout {
            config.server.keepalive_timeout_secs = secs;
        }
        if let Some(health) = self.health {
            config.server.health_path = health;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Args::parse().into_config();
    let addr = SocketAddr::new(config.server.bind, config.server.port);

    info!("Starting server...");
    info!(
        "Listening on {} (keepalive {}s, health {})",
        addr, config.server.keepalive_timeout_secs, config.server.health_path
    );

    let supervisor = Supervisor::new(
        addr,
        ServerOptions::from(&config.server),
        RestartPolicy::from(&config.supervisor),
    );
    supervisor.run(shutdown_signal()).await?;

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down");
    }
}

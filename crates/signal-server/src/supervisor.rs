//! Supervisor that keeps a signal server running
//!
//! Every attempt runs a brand new [`SignalServer`], so a restart always
//! starts with an empty registry and no sessions.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use signal_core::SupervisorConfig;

use crate::error::SupervisorError;
use crate::server::{ServeExit, ServerOptions, SignalServer, StopHandle};

/// When and how often to restart the serve loop
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Crash restarts allowed (0 = unlimited)
    pub max_restarts: u32,
    /// Delay before a crash restart
    pub backoff: Duration,
    /// Start a fresh server after an explicit stop
    pub restart_on_stop: bool,
    /// An instance that crashes after serving this long resets the count
    pub stable_after: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            backoff: config.restart_backoff(),
            restart_on_stop: config.restart_on_stop,
            stable_after: config.restart_reset(),
        }
    }
}

impl RestartPolicy {
    fn allows(&self, restarts: u32) -> bool {
        self.max_restarts == 0 || restarts <= self.max_restarts
    }
}

pub struct Supervisor {
    addr: SocketAddr,
    options: ServerOptions,
    policy: RestartPolicy,
    current: Mutex<Option<StopHandle>>,
    generation: AtomicU32,
}

impl Supervisor {
    pub fn new(addr: SocketAddr, options: ServerOptions, policy: RestartPolicy) -> Self {
        Self {
            addr,
            options,
            policy,
            current: Mutex::new(None),
            generation: AtomicU32::new(0),
        }
    }

    /// Stop the running server instance, if any
    pub fn stop_current(&self) {
        if let Some(handle) = self.current.lock().as_ref() {
            handle.stop();
        }
    }

    /// Number of server instances started so far
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Serve until `shutdown` resolves or the restart budget runs out
    pub async fn run<F>(&self, shutdown: F) -> Result<(), SupervisorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut restarts = 0u32;

        loop {
            let server = SignalServer::new(self.options.clone());
            *self.current.lock() = Some(server.stop_handle());
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            info!("Starting server instance {} on {}", generation, self.addr);

            let started = Instant::now();
            let result = server.serve(self.addr, shutdown.as_mut()).await;
            self.current.lock().take();

            match result {
                Ok(ServeExit::Shutdown) => {
                    info!("Shutdown requested, supervisor exiting");
                    return Ok(());
                }
                Ok(ServeExit::Stopped) if self.policy.restart_on_stop => {
                    info!("Restarting server...");
                }
                Ok(ServeExit::Stopped) => return Ok(()),
                Err(e) => {
                    let uptime = started.elapsed();
                    if restarts > 0 && uptime >= self.policy.stable_after {
                        debug!("Instance {} ran for {:?}, resetting restart count", generation, uptime);
                        restarts = 0;
                    }
                    restarts += 1;
                    if !self.policy.allows(restarts) {
                        return Err(SupervisorError::RestartLimit {
                            restarts: restarts - 1,
                            last: e,
                        });
                    }
                    warn!(
                        "Server crashed: {}; restarting in {:?} (restart {})",
                        e, self.policy.backoff, restarts
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.policy.backoff) => {}
                        _ = shutdown.as_mut() => return Ok(()),
                    }
                }
            }
        }
    }
}

//! Keepalive monitor
//!
//! Wraps each receive in a timeout. When the peer stays quiet for a full
//! interval a ping is queued and the wait starts over. A missing pong never
//! ends the connection here; that is left to the transport.

use std::time::Duration;

use futures_util::{Stream, StreamExt};
use tokio::time::timeout;
use tracing::debug;

use crate::error::ConnectionError;
use crate::registry::PeerHandle;

/// Floor for the ping interval
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct KeepaliveMonitor {
    interval: Duration,
    /// Pings sent since the last received item
    consecutive: u64,
    total: u64,
}

impl KeepaliveMonitor {
    /// Intervals shorter than [`MIN_INTERVAL`] are raised to it
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            consecutive: 0,
            total: 0,
        }
    }

    /// Next item from `stream`, pinging `handle` after every quiet interval.
    ///
    /// Cancel safe as long as `stream.next()` is.
    pub async fn recv<S>(
        &mut self,
        stream: &mut S,
        handle: &PeerHandle,
        peer: &str,
    ) -> Result<Option<S::Item>, ConnectionError>
    where
        S: Stream + Unpin,
    {
        loop {
            match timeout(self.interval, stream.next()).await {
                Ok(item) => {
                    self.consecutive = 0;
                    return Ok(item);
                }
                Err(_) => {
                    self.consecutive += 1;
                    self.total += 1;
                    debug!(
                        "Sending keepalive ping to {} ({} unanswered)",
                        peer, self.consecutive
                    );
                    handle.ping().await?;
                }
            }
        }
    }

    pub fn pings_sent(&self) -> u64 {
        self.total
    }
}

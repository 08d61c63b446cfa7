//! WebSocket signal server implementation

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, info, warn};

use signal_core::{PayloadPolicy, ServerConfig};

use crate::connection::handle_websocket;
use crate::error::{ConnectionError, ServeError};
use crate::registry::wait_closed;
use crate::state::SignalState;

/// Bytes inspected when deciding whether a connection is a health check
const PEEK_LEN: usize = 1024;

/// Attempts at seeing a full request line before giving up on it
const PEEK_ATTEMPTS: usize = 5;

/// First pause after the process runs out of descriptors or buffers
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(100);

/// Longest pause between accept attempts while resources stay exhausted
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Runtime options for a server instance
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub keepalive_timeout: Duration,
    pub health_path: String,
    pub max_queue: usize,
    pub max_message_size: usize,
    pub payload_policy: PayloadPolicy,
    pub drain_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for ServerOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            keepalive_timeout: config.keepalive_timeout(),
            health_path: config.health_path.clone(),
            max_queue: config.max_queue,
            max_message_size: config.max_message_size,
            payload_policy: config.malformed_payload,
            drain_timeout: config.drain_timeout(),
        }
    }
}

impl ServerOptions {
    fn websocket_config(&self) -> WebSocketConfig {
        let mut config = WebSocketConfig::default();
        config.max_message_size = Some(self.max_message_size);
        config.max_frame_size = Some(self.max_message_size);
        config
    }
}

/// Why the accept loop returned without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    /// [`StopHandle::stop`] was called
    Stopped,
    /// The caller's shutdown future resolved
    Shutdown,
}

/// Stops a running server from another task
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            info!("Stopping server...");
        }
    }
}

/// Signal server state
pub struct SignalServer {
    state: Arc<SignalState>,
    options: Arc<ServerOptions>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl SignalServer {
    pub fn new(options: ServerOptions) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            state: Arc::new(SignalState::new()),
            options: Arc::new(options),
            stop_tx: Arc::new(stop_tx),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Shared registry and sessions
    pub fn state(&self) -> Arc<SignalState> {
        self.state.clone()
    }

    /// Bind a listener for [`SignalServer::serve_listener`]
    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServeError> {
        TcpListener::bind(addr)
            .await
            .map_err(|source| ServeError::Bind { addr, source })
    }

    /// Bind `addr` and serve until stopped or `shutdown` resolves
    pub async fn serve<F>(&self, addr: SocketAddr, shutdown: F) -> Result<ServeExit, ServeError>
    where
        F: Future<Output = ()>,
    {
        let listener = Self::bind(addr).await?;
        self.serve_listener(listener, shutdown).await
    }

    /// Run the accept loop on an already bound listener.
    ///
    /// Whatever ends the loop, open connections are closed and the registry
    /// and session table are cleared before returning.
    pub async fn serve_listener<F>(&self, listener: TcpListener, shutdown: F) -> Result<ServeExit, ServeError>
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!("Signal server listening on {}", addr);
        }

        let mut connections = JoinSet::new();
        let mut stop_rx = self.stop_tx.subscribe();
        let mut backoff = ACCEPT_BACKOFF_MIN;
        tokio::pin!(shutdown);

        let exit = loop {
            tokio::select! {
                _ = &mut shutdown => break Ok(ServeExit::Shutdown),
                _ = wait_closed(&mut stop_rx) => break Ok(ServeExit::Stopped),
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        backoff = ACCEPT_BACKOFF_MIN;
                        debug!("Connected to {}", peer_addr);
                        let state = self.state.clone();
                        let options = self.options.clone();
                        connections.spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, state, options).await {
                                debug!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) if is_transient_accept_error(&e) => {
                        warn!("Accept failed, continuing: {}", e);
                    }
                    Err(e) if is_resource_exhaustion(&e) => {
                        warn!("Accept failed: {}; pausing for {:?}", e, backoff);
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = &mut shutdown => break Ok(ServeExit::Shutdown),
                            _ = wait_closed(&mut stop_rx) => break Ok(ServeExit::Stopped),
                        }
                        backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                    }
                    Err(e) => break Err(ServeError::Accept(e)),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("Connection task panicked: {}", e);
                        }
                    }
                }
            }
        };

        self.drain(connections).await;
        exit
    }

    /// Close every connection, wait for handlers, then forget all state
    async fn drain(&self, mut connections: JoinSet<()>) {
        self.state.close_all();

        let drained = timeout(self.options.drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("{} connections still open after drain timeout, aborting", connections.len());
            connections.shutdown().await;
        }

        self.state.clear();
        info!("Stopped.");
    }

    pub fn peer_count(&self) -> usize {
        self.state.peer_count()
    }

    pub fn session_count(&self) -> usize {
        self.state.session_count()
    }
}

impl Default for SignalServer {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

/// Handle a single connection (health check or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<SignalState>,
    options: Arc<ServerOptions>,
) -> Result<(), ConnectionError> {
    if is_health_request(&stream, &options.health_path).await? {
        return handle_http_request(&mut stream).await;
    }

    let ws = accept_async_with_config(stream, Some(options.websocket_config())).await?;
    handle_websocket(ws, peer_addr, state, options).await
}

/// Peek at the request line and compare its path with `health_path`
async fn is_health_request(stream: &TcpStream, health_path: &str) -> Result<bool, std::io::Error> {
    let mut buf = [0u8; PEEK_LEN];

    for _ in 0..PEEK_ATTEMPTS {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if let Some(end) = buf[..n].windows(2).position(|w| w == b"\r\n") {
            return Ok(request_path(&buf[..end]) == Some(health_path));
        }
        if n == buf.len() {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(false)
}

/// Path of a `GET` request line
fn request_path(line: &[u8]) -> Option<&str> {
    let line = std::str::from_utf8(line).ok()?;
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("GET"), Some(path)) => Some(path),
        _ => None,
    }
}

/// Answer a health check and close
async fn handle_http_request(stream: &mut TcpStream) -> Result<(), ConnectionError> {
    let mut buf = vec![0u8; PEEK_LEN];
    let _ = stream.read(&mut buf).await?;

    let body = "OK\n";
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

/// The failed connection is gone but the listener is fine
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
    )
}

/// Out of descriptors, buffers or memory. Accepting again works once
/// existing connections release some.
fn is_resource_exhaustion(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(
            e.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        // WSAEMFILE, WSAENOBUFS
        matches!(e.raw_os_error(), Some(10024 | 10055))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_core::{DEFAULT_HEALTH_PATH, DEFAULT_MAX_QUEUE, MAX_MESSAGE_SIZE};

    #[test]
    fn test_server_creation() {
        let server = SignalServer::default();
        assert_eq!(server.peer_count(), 0);
        assert_eq!(server.session_count(), 0);
    }

    #[test]
    fn test_default_options() {
        let options = ServerOptions::default();
        assert_eq!(options.keepalive_timeout, Duration::from_secs(30));
        assert_eq!(options.health_path, DEFAULT_HEALTH_PATH);
        assert_eq!(options.max_queue, DEFAULT_MAX_QUEUE);
        assert_eq!(options.max_message_size, MAX_MESSAGE_SIZE);
        assert_eq!(options.payload_policy, PayloadPolicy::Disconnect);
    }

    #[test]
    fn test_request_path() {
        assert_eq!(request_path(b"GET /health HTTP/1.1"), Some("/health"));
        assert_eq!(request_path(b"GET / HTTP/1.1"), Some("/"));
        assert_eq!(request_path(b"POST /health HTTP/1.1"), None);
        assert_eq!(request_path(b"\x16\x03\x01"), None);
    }

    #[test]
    fn test_accept_error_classes() {
        use std::io::{Error, ErrorKind};

        assert!(is_transient_accept_error(&Error::from(ErrorKind::ConnectionAborted)));
        assert!(!is_transient_accept_error(&Error::from(ErrorKind::PermissionDenied)));

        assert!(is_resource_exhaustion(&Error::from(ErrorKind::OutOfMemory)));
        assert!(!is_resource_exhaustion(&Error::from(ErrorKind::PermissionDenied)));
        assert!(!is_resource_exhaustion(&Error::from(ErrorKind::ConnectionReset)));
    }

    #[cfg(unix)]
    #[test]
    fn test_descriptor_exhaustion_is_not_fatal() {
        use std::io::Error;

        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            let e = Error::from_raw_os_error(errno);
            assert!(is_resource_exhaustion(&e), "errno {} should pause accepting", errno);
        }
        assert!(!is_resource_exhaustion(&Error::from_raw_os_error(libc::EBADF)));
    }

    #[tokio::test]
    async fn test_stop_handle_ends_serve() {
        let server = SignalServer::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stop = server.stop_handle();
        stop.stop();

        let exit = server
            .serve_listener(listener, std::future::pending())
            .await
            .unwrap();
        assert_eq!(exit, ServeExit::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_future_ends_serve() {
        let server = SignalServer::default();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let exit = server.serve_listener(listener, async {}).await.unwrap();
        assert_eq!(exit, ServeExit::Shutdown);
    }
}

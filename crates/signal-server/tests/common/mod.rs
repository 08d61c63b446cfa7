//! Shared test helpers for signal-server integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use signal_server::{ServeError, ServeExit, ServerOptions, SignalServer, SignalState, StopHandle};

/// How long a test waits for any single server reaction.
pub const WAIT: Duration = Duration::from_secs(3);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A server running on an ephemeral localhost port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<SignalState>,
    pub stop: StopHandle,
    pub task: JoinHandle<Result<ServeExit, ServeError>>,
}

/// Options with short timeouts suitable for tests.
pub fn test_options() -> ServerOptions {
    ServerOptions {
        drain_timeout: Duration::from_millis(500),
        ..ServerOptions::default()
    }
}

pub async fn start_server(options: ServerOptions) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = SignalServer::new(options);
    let state = server.state();
    let stop = server.stop_handle();
    let task = tokio::spawn(async move {
        server
            .serve_listener(listener, std::future::pending())
            .await
    });

    TestServer {
        addr,
        state,
        stop,
        task,
    }
}

/// Reserve a free port and release it.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{}/", addr))
        .await
        .expect("WebSocket connect failed");
    client
}

pub async fn send(client: &mut Client, text: &str) {
    client
        .send(Message::Text(text.to_string()))
        .await
        .expect("send failed");
}

/// Connect and complete the `HELLO` handshake as `uid`.
pub async fn hello(addr: SocketAddr, uid: &str) -> Client {
    let mut client = connect(addr).await;
    send(&mut client, &format!("HELLO {}", uid)).await;
    assert_eq!(recv_text(&mut client).await, "HELLO");
    client
}

/// Connect `caller` and `callee` and pair them.
pub async fn paired(addr: SocketAddr, caller: &str, callee: &str) -> (Client, Client) {
    let mut a = hello(addr, caller).await;
    let b = hello(addr, callee).await;
    send(&mut a, &format!("SESSION {}", callee)).await;
    assert_eq!(recv_text(&mut a).await, "SESSION_OK");
    (a, b)
}

/// Next text frame, skipping pings and pongs.
pub async fn recv_text(client: &mut Client) -> String {
    loop {
        let msg = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

/// Wait until the server closes `client`, returning the close frame if any.
pub async fn expect_closed(client: &mut Client) -> Option<CloseFrame<'static>> {
    loop {
        let next = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(other)) => panic!("expected close, got {:?}", other),
            Some(Err(_)) | None => return None,
        }
    }
}

/// Assert nothing but keepalive traffic arrives for `period`.
pub async fn expect_silence(client: &mut Client, period: Duration) {
    let deadline = tokio::time::Instant::now() + period;
    loop {
        match tokio::time::timeout_at(deadline, client.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            Ok(other) => panic!("expected silence, got {:?}", other),
        }
    }
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

//! Per-connection handling: handshake, command dispatch, relay, teardown
//!
//! Each accepted WebSocket gets one reader (the task running
//! [`handle_websocket`]) and one writer task draining the peer's outbound
//! queue. Other tasks reach the connection only through its [`PeerHandle`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use signal_core::{validate_hello, ClientCommand, HandshakeError, ServerReply};

use crate::error::ConnectionError;
use crate::keepalive::KeepaliveMonitor;
use crate::registry::{wait_closed, Outbound, PeerEntry, PeerHandle};
use crate::relay::relay_frame;
use crate::server::ServerOptions;
use crate::state::{Route, SignalState};

/// Time allowed for a close handshake or final flush
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a WebSocket connection from greeting to teardown
pub async fn handle_websocket<S>(
    mut ws: WebSocketStream<S>,
    addr: SocketAddr,
    state: Arc<SignalState>,
    options: Arc<ServerOptions>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let connection_id = generate_connection_id();
    let (handle, channels) = PeerHandle::channel(options.max_queue);

    let uid = handshake(&mut ws, addr, &state, &handle, &connection_id).await?;

    let (sink, mut stream) = ws.split();
    let mut writer = tokio::spawn(write_loop(
        sink,
        channels.outbound,
        channels.closed.clone(),
        uid.clone(),
    ));

    let mut keepalive = KeepaliveMonitor::new(options.keepalive_timeout);
    let result = serve_peer(
        &mut stream,
        &uid,
        &handle,
        channels.closed,
        &mut keepalive,
        &state,
        &options,
    )
    .await;
    match &result {
        Ok(()) => debug!("Connection to peer {} ended", uid),
        Err(e) => info!("Connection to peer {} ended: {}", uid, e),
    }
    debug!("Sent {} keepalive pings to {}", keepalive.pings_sent(), uid);

    if let Some(teardown) = state.remove_peer(&uid, &connection_id) {
        if let Some((session, partner)) = teardown.session {
            info!("Session {} ended by {} leaving, closed {}", session, uid, partner);
        }
    }
    handle.close();

    if timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    result
}

/// Read and validate the greeting, then register the peer.
///
/// `HELLO` is queued before registration so it precedes anything another
/// peer can send once the uid is visible.
async fn handshake<S>(
    ws: &mut WebSocketStream<S>,
    addr: SocketAddr,
    state: &SignalState,
    handle: &PeerHandle,
    connection_id: &str,
) -> Result<String, ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => break text,
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Close(_))) | None => return Err(HandshakeError::Closed.into()),
            Some(Ok(_)) => return Err(reject(ws, addr, HandshakeError::InvalidProtocol).await),
            Some(Err(e)) => return Err(e.into()),
        }
    };

    let uid = match validate_hello(&frame) {
        Ok(uid) => uid,
        Err(e) => return Err(reject(ws, addr, e).await),
    };

    handle.try_send_text(ServerReply::Hello.to_string())?;
    let entry = PeerEntry::new(handle.clone(), addr, connection_id);
    if let Err(e) = state.register(&uid, entry) {
        return Err(reject(ws, addr, e).await);
    }

    debug!("Handshake from {} complete as {} ({})", addr, uid, connection_id);
    Ok(uid)
}

/// Close a connection that failed the handshake
async fn reject<S>(ws: &mut WebSocketStream<S>, addr: SocketAddr, error: HandshakeError) -> ConnectionError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    warn!("Rejecting handshake from {}: {}", addr, error);

    let frame = CloseFrame {
        code: CloseCode::from(error.close_code()),
        reason: error.close_reason().into(),
    };
    if ws.close(Some(frame)).await.is_ok() {
        // Wait for the client's close reply
        let _ = timeout(CLOSE_TIMEOUT, async {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;
    }
    error.into()
}

/// Reader loop for a registered peer
async fn serve_peer<St>(
    stream: &mut St,
    uid: &str,
    handle: &PeerHandle,
    mut closed: watch::Receiver<bool>,
    keepalive: &mut KeepaliveMonitor,
    state: &SignalState,
    options: &ServerOptions,
) -> Result<(), ConnectionError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let item = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => {
                debug!("Connection to {} closed by server", uid);
                return Ok(());
            }
            item = keepalive.recv(&mut *stream, handle, uid) => item?,
        };

        let text = match item {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(Message::Binary(_))) => {
                debug!("Ignoring binary frame from {}", uid);
                continue;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(e.into()),
        };

        match state.route(uid)? {
            Route::Relay {
                partner,
                handle: partner_handle,
            } => {
                relay_frame(uid, &partner, &partner_handle, text, options.payload_policy).await?;
            }
            Route::Command => dispatch_command(uid, &text, handle, state).await?,
        }
    }
}

/// Handle a control frame from an idle peer
async fn dispatch_command(
    uid: &str,
    text: &str,
    handle: &PeerHandle,
    state: &SignalState,
) -> Result<(), ConnectionError> {
    match ClientCommand::parse(text) {
        ClientCommand::Session { callee } => {
            info!("{} command {:?}", uid, text);
            let reply = handle.reserve().await?;
            match state.request_session(uid, &callee, reply) {
                Ok(_) => Ok(()),
                Err(ConnectionError::Rejected(e)) => {
                    info!("Session request from {} rejected: {}", uid, e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        _ => {
            info!("Ignoring unknown message {:?} from {}", text, uid);
            Ok(())
        }
    }
}

/// Drain the outbound queue into the socket until a close is requested.
///
/// Frames already queued when the close arrives are still flushed.
async fn write_loop<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<Outbound>,
    mut closed: watch::Receiver<bool>,
    uid: String,
) where
    Si: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    loop {
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            next = outbound.recv() => {
                let Some(frame) = next else { break };
                if let Err(e) = sink.send(into_message(frame)).await {
                    debug!("Send to {} failed: {}", uid, e);
                    return;
                }
            }
        }
    }

    while let Ok(frame) = outbound.try_recv() {
        if sink.send(into_message(frame)).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}

fn into_message(frame: Outbound) -> Message {
    match frame {
        Outbound::Text(text) => Message::Text(text),
        Outbound::Ping => Message::Ping(Vec::new()),
    }
}

/// Generate a connection id for logs and ownership checks
fn generate_connection_id() -> String {
    static FALLBACK: AtomicU64 = AtomicU64::new(0);

    let mut bytes = [0u8; 8];
    if getrandom::fill(&mut bytes).is_err() {
        bytes = FALLBACK.fetch_add(1, Ordering::Relaxed).to_be_bytes();
    }
    hex::encode(bytes)
}

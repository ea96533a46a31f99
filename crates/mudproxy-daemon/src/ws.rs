//! Per-connection handling: handshake dispatch, control-plane framing, and
//! the upstream I/O tasks a session's lifetime spans (§4.6, §4.7).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, warn, Instrument};

use mudproxy_core::control::{
    classify_frame, decode_client_message, encode_server_message, ClientControlMessage, FrameKind,
    ServerControlMessage,
};
use mudproxy_core::SessionConfig;
use mudproxy_session::{DetachAction, Session};

use crate::handshake::{extract_client_addr, HandshakeQuery};
use crate::state::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const UPSTREAM_READ_BUF: usize = 8192;
/// WebSocket normal-closure status code (RFC 6455 §7.4.1).
const NORMAL_CLOSURE: u16 = 1000;

/// Upgrades an inbound `/ws` request to a WebSocket and dispatches it per
/// the handshake rules in §4.6.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    headers: HeaderMap,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let (client_ip, client_port) = extract_client_addr(&headers, peer);
    ws.on_upgrade(move |socket| handle_connection(socket, state, query, client_ip, client_port))
}

struct ConnectionSetup {
    session: Arc<Session>,
    token: CancellationToken,
    client_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    query: HandshakeQuery,
    client_ip: std::net::IpAddr,
    client_port: u16,
) {
    let (ws_sink, ws_stream) = socket.split();

    let setup = match query.session_id.clone() {
        Some(id) => match state.registry.get(&id) {
            Some(session) => attach_existing(&state, session, client_ip, client_port).await,
            None => {
                reject_unknown_session(ws_sink).await;
                return;
            }
        },
        None => match create_new_session(&state, &query, client_ip, client_port).await {
            Ok(setup) => setup,
            Err(reason) => {
                // UpstreamConnectFailure / id-space exhaustion (§7): no session
                // was ever registered, so there is nothing to clean up. §7
                // handles UpstreamConnectFailure as if upstream's own `close`
                // had already fired rather than as a `SessionNotFound`
                // reattach failure, so the transport just closes with no
                // error frame — the same shape `spawn_upstream_io` uses for a
                // mid-session upstream close.
                warn!(%reason, "could not establish a new session");
                close_without_session(ws_sink).await;
                return;
            }
        },
    };

    let id = setup.session.id.clone();
    run_connection(state, setup, ws_sink, ws_stream)
        .instrument(info_span!("session", session_id = %id))
        .await;
}

async fn attach_existing(
    state: &AppState,
    session: Arc<Session>,
    client_ip: std::net::IpAddr,
    client_port: u16,
) -> ConnectionSetup {
    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let attach = session.attach_client(client_tx.clone(), client_ip, client_port).await;

    let _ = client_tx.send(encode_server_message(&ServerControlMessage::Reconnected {
        session_id: session.id.clone(),
        buffered_count: attach.buffered.len(),
    }));
    for message in attach.buffered {
        let _ = client_tx.send(message.data);
    }

    let token = state
        .tokens
        .get(&session.id)
        .map(|entry| entry.value().clone())
        .unwrap_or_else(CancellationToken::new);

    ConnectionSetup { session, token, client_rx }
}

async fn create_new_session(
    state: &AppState,
    query: &HandshakeQuery,
    client_ip: std::net::IpAddr,
    client_port: u16,
) -> Result<ConnectionSetup, String> {
    let upstream_addr =
        mudproxy_net::UpstreamAddr::parse(&state.config.upstream_url).map_err(|e| e.to_string())?;
    let proxy_source = state
        .config
        .use_proxy_protocol
        .then_some(mudproxy_net::ProxySource { ip: client_ip, port: client_port });
    let upstream = mudproxy_net::connect(&upstream_addr, proxy_source)
        .await
        .map_err(|e| e.to_string())?;

    let id = state.registry.allocate_id().map_err(|e| e.to_string())?;
    let config = SessionConfig::from_overrides(query.persistence_timeout, query.max_buffer_lines);

    let (client_tx, client_rx) = mpsc::unbounded_channel();
    let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
    let session = Arc::new(Session::new(
        id.clone(),
        config,
        client_ip,
        client_port,
        client_tx.clone(),
        upstream_tx,
    ));
    let token = CancellationToken::new();

    spawn_upstream_io(state.clone(), Arc::clone(&session), upstream, upstream_rx, token.clone());

    state.registry.insert(Arc::clone(&session));
    state.tokens.insert(id.clone(), token.clone());

    let _ = client_tx.send(encode_server_message(&ServerControlMessage::Session {
        session_id: id,
        config,
    }));

    Ok(ConnectionSetup { session, token, client_rx })
}

/// Spawns the two tasks that own a session's upstream connection for its
/// entire lifetime (which may span several client connections, across
/// persistence): one reads from the socket and feeds the Terminal
/// Negotiation Filter/buffer via [`Session::push_upstream_data`]; the other
/// drains bytes the session wants written (negotiation replies, forwarded
/// client bytes) onto the socket. Both select on `token`, which is this
/// session's lifetime token, not any one connection's.
fn spawn_upstream_io(
    state: AppState,
    session: Arc<Session>,
    upstream: mudproxy_net::Upstream,
    mut upstream_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    token: CancellationToken,
) {
    let (mut read_half, mut write_half) = tokio::io::split(upstream);

    let read_session = Arc::clone(&session);
    let read_token = token.clone();
    let read_state = state.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; UPSTREAM_READ_BUF];
        loop {
            tokio::select! {
                () = read_token.cancelled() => break,
                result = read_half.read(&mut buf) => match result {
                    Ok(0) => {
                        read_session.mark_upstream_closed().await;
                        read_state.cleanup_session(&read_session.id);
                        break;
                    }
                    Ok(n) => read_session.push_upstream_data(buf[..n].to_vec()).await,
                    Err(error) => {
                        warn!(session_id = %read_session.id, %error, "upstream read error (advisory; close follows)");
                        read_session.mark_upstream_closed().await;
                        read_state.cleanup_session(&read_session.id);
                        break;
                    }
                },
            }
        }
    });

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                maybe = upstream_rx.recv() => match maybe {
                    Some(bytes) => {
                        if write_half.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
}

async fn run_connection(
    state: AppState,
    setup: ConnectionSetup,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
) {
    let ConnectionSetup { session, token: session_token, mut client_rx } = setup;
    let conn_token = session_token.child_token();

    let writer_token = conn_token.clone();
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // first tick fires immediately; consume it
        loop {
            tokio::select! {
                () = writer_token.cancelled() => {
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame { code: NORMAL_CLOSURE, reason: "".into() })))
                        .await;
                    break;
                }
                maybe = client_rx.recv() => match maybe {
                    Some(frame) => {
                        if ws_sink.send(Message::Binary(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = ping_interval.tick() => {
                    if ws_sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut graceful = false;
    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            Message::Binary(bytes) => match classify_frame(&bytes) {
                FrameKind::Control(json) => handle_client_control(&session, json).await,
                FrameKind::Opaque(data) => session.push_client_data(data.to_vec()).await,
            },
            Message::Close(frame) => {
                graceful = frame.as_ref().is_some_and(|f| f.code == NORMAL_CLOSURE);
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    conn_token.cancel();
    let _ = writer.await;

    match session.detach_client(graceful).await {
        DetachAction::CleanupNow => state.cleanup_session(&session.id),
        DetachAction::ArmTimer { duration, generation } => {
            let state = state.clone();
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                if session.try_expire(generation).await {
                    state.cleanup_session(&session.id);
                }
            });
        }
    }
}

async fn handle_client_control(session: &Session, json: &[u8]) {
    match decode_client_message(json) {
        Ok(ClientControlMessage::UpdateConfig { persistence_timeout, max_buffer_lines }) => {
            let config = session.update_config(persistence_timeout, max_buffer_lines).await;
            session
                .send_to_client(encode_server_message(&ServerControlMessage::ConfigUpdated { config }))
                .await;
        }
        Err(error) => {
            // MalformedControlMessage (§7): log and ignore, session continues untouched.
            warn!(%error, "ignoring malformed control message");
        }
    }
}

async fn reject_unknown_session(mut ws_sink: SplitSink<WebSocket, Message>) {
    let error = encode_server_message(&ServerControlMessage::Error {
        error: "Session not found".to_string(),
    });
    let _ = ws_sink.send(Message::Binary(error)).await;
    let _ = ws_sink
        .send(Message::Close(Some(CloseFrame { code: NORMAL_CLOSURE, reason: "".into() })))
        .await;
}

/// Closes a connection for which no session was ever created
/// (`UpstreamConnectFailure` or session-id-space exhaustion, §7), with no
/// `error` control frame: the client never received a `sessionId` to begin
/// with, so there is no reattach target to report as missing, and §7 treats
/// this case as indistinguishable from upstream having already closed.
async fn close_without_session(mut ws_sink: SplitSink<WebSocket, Message>) {
    let _ = ws_sink
        .send(Message::Close(Some(CloseFrame { code: NORMAL_CLOSURE, reason: "".into() })))
        .await;
}

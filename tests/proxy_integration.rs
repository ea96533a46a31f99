//! End-to-end scenarios exercising the full bridge: a `tokio-tungstenite`
//! client stands in for the browser, a bare `TcpListener` stands in for the
//! MUD upstream, and `mudproxy_daemon::run` is the proxy itself.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use mudproxy_core::config::SessionConfig;
use mudproxy_core::ProxyConfig;

/// Binds to an ephemeral port, reports it, and drops the bound socket so
/// the real listener (daemon or fake upstream) can reuse the address.
async fn free_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    addr
}

async fn spawn_proxy(upstream_url: String) -> SocketAddr {
    let listen_addr = free_addr().await;
    let config = ProxyConfig {
        listen_addr,
        upstream_url,
        default_session_config: SessionConfig::default(),
        use_proxy_protocol: false,
    };
    tokio::spawn(async move {
        let _ = mudproxy_daemon::run(config).await;
    });
    // Give the listener a moment to bind before the test dials it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    listen_addr
}

async fn connect_ws(
    listen_addr: SocketAddr,
    session_id: Option<&str>,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut url = format!("ws://{listen_addr}/ws");
    if let Some(id) = session_id {
        url.push_str("?sessionId=");
        url.push_str(id);
    }
    let (stream, _response) = tokio_tungstenite::connect_async(url).await.expect("ws connect");
    stream
}

fn decode_session_id(frame: &[u8]) -> String {
    let value: serde_json::Value =
        serde_json::from_slice(&frame[1..]).expect("valid control json");
    assert_eq!(value["type"], "session");
    value["sessionId"].as_str().expect("sessionId field").to_string()
}

#[tokio::test]
async fn happy_path_bridges_client_and_upstream_bytes() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"look");
        socket.write_all(b"A dim room.").await.unwrap();
    });

    let listen_addr = spawn_proxy(format!("tcp://{upstream_addr}")).await;
    let mut ws = connect_ws(listen_addr, None).await;

    let first = ws.next().await.unwrap().unwrap();
    let Message::Binary(frame) = first else { panic!("expected binary control frame") };
    let _session_id = decode_session_id(&frame);

    ws.send(Message::Binary(b"look".to_vec())).await.unwrap();

    let reply = ws.next().await.unwrap().unwrap();
    let Message::Binary(bytes) = reply else { panic!("expected binary data frame") };
    assert_eq!(bytes, b"A dim room.");

    upstream_task.await.unwrap();
}

#[tokio::test]
async fn replay_buffer_is_delivered_on_reattach() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();

    let upstream_task = tokio::spawn(async move {
        let (mut socket, _) = upstream_listener.accept().await.unwrap();
        // Wait for the client to disconnect before sending anything, so the
        // bytes land in the session's replay buffer rather than the live
        // WebSocket.
        tokio::time::sleep(Duration::from_millis(200)).await;
        socket.write_all(b"You missed this.").await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let listen_addr = spawn_proxy(format!("tcp://{upstream_addr}")).await;
    let mut ws = connect_ws(listen_addr, None).await;

    let first = ws.next().await.unwrap().unwrap();
    let Message::Binary(frame) = first else { panic!("expected binary control frame") };
    let session_id = decode_session_id(&frame);

    // Disconnect involuntarily (no close handshake) while upstream is silent.
    drop(ws);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let mut ws2 = connect_ws(listen_addr, Some(&session_id)).await;
    let reconnected = ws2.next().await.unwrap().unwrap();
    let Message::Binary(frame) = reconnected else { panic!("expected reconnected control frame") };
    let value: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
    assert_eq!(value["type"], "reconnected");
    assert_eq!(value["bufferedCount"], 1);

    let replayed = ws2.next().await.unwrap().unwrap();
    let Message::Binary(bytes) = replayed else { panic!("expected replayed data frame") };
    assert_eq!(bytes, b"You missed this.");

    upstream_task.abort();
}

#[tokio::test]
async fn graceful_close_tears_session_down_immediately() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (_socket, _) = upstream_listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let listen_addr = spawn_proxy(format!("tcp://{upstream_addr}")).await;
    let mut ws = connect_ws(listen_addr, None).await;
    let _ = ws.next().await.unwrap().unwrap();

    ws.close(None).await.unwrap();
    // Drain until the server's own close frame arrives.
    while ws.next().await.transpose().unwrap().is_some() {}
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats_url = format!("http://{listen_addr}/stats");
    let body = reqwest_like_get(&stats_url).await;
    assert!(body.contains("\"active_sessions\":0"));
    assert!(body.contains("\"persisting_sessions\":0"));

    upstream_task.abort();
}

#[tokio::test]
async fn zero_persistence_timeout_discards_session_on_involuntary_disconnect() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (_socket, _) = upstream_listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let listen_addr = free_addr().await;
    let config = ProxyConfig {
        listen_addr,
        upstream_url: format!("tcp://{upstream_addr}"),
        default_session_config: SessionConfig::from_overrides(Some(0), None),
        use_proxy_protocol: false,
    };
    tokio::spawn(async move {
        let _ = mudproxy_daemon::run(config).await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut ws = connect_ws(listen_addr, None).await;
    let _ = ws.next().await.unwrap().unwrap();

    drop(ws); // involuntary, but persistenceTimeout=0 means cleanup happens anyway
    tokio::time::sleep(Duration::from_millis(200)).await;

    let body = reqwest_like_get(&format!("http://{listen_addr}/stats")).await;
    assert!(body.contains("\"active_sessions\":0"));
    assert!(body.contains("\"persisting_sessions\":0"));

    upstream_task.abort();
}

#[tokio::test]
async fn update_config_control_message_is_acknowledged() {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
        let (_socket, _) = upstream_listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let listen_addr = spawn_proxy(format!("tcp://{upstream_addr}")).await;
    let mut ws = connect_ws(listen_addr, None).await;
    let _ = ws.next().await.unwrap().unwrap();

    let mut request = vec![0x00];
    request.extend_from_slice(
        br#"{"type":"updateConfig","persistenceTimeout":60000,"maxBufferLines":500}"#,
    );
    ws.send(Message::Binary(request)).await.unwrap();

    let ack = ws.next().await.unwrap().unwrap();
    let Message::Binary(frame) = ack else { panic!("expected ack control frame") };
    let value: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
    assert_eq!(value["type"], "configUpdated");
    assert_eq!(value["config"]["persistenceTimeout"], 60_000);
    assert_eq!(value["config"]["maxBufferLines"], 500);

    upstream_task.abort();
}

#[tokio::test]
async fn unknown_session_id_is_rejected_with_error_and_close() {
    let listen_addr = spawn_proxy("tcp://127.0.0.1:1".to_string()).await;
    let mut ws = connect_ws(listen_addr, Some("does-not-exist-00000000")).await;

    let error = ws.next().await.unwrap().unwrap();
    let Message::Binary(frame) = error else { panic!("expected error control frame") };
    let value: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
    assert_eq!(value["type"], "error");

    let close = ws.next().await.unwrap().unwrap();
    assert!(matches!(close, Message::Close(_)));
}

#[tokio::test]
async fn unreachable_upstream_on_new_connection_closes_with_no_error_frame() {
    // No `sessionId` supplied: this is the create-path, not a reattach, so
    // the unreachable upstream must not surface as `SessionNotFound`'s
    // "Session not found" message (§7 keeps `UpstreamConnectFailure`
    // distinct and has it follow the normal upstream-closed cleanup path).
    let listen_addr = spawn_proxy("tcp://127.0.0.1:1".to_string()).await;
    let mut ws = connect_ws(listen_addr, None).await;

    let first = ws.next().await.unwrap().unwrap();
    assert!(matches!(first, Message::Close(_)), "expected an immediate close, got {first:?}");
}

/// Minimal GET over a raw TCP socket: avoids pulling in a full HTTP client
/// dependency just to read the two JSON fields the stats assertions check.
async fn reqwest_like_get(url: &str) -> String {
    let without_scheme = url.trim_start_matches("http://");
    let (authority, path) = without_scheme.split_once('/').unwrap_or((without_scheme, ""));
    let mut stream = tokio::net::TcpStream::connect(authority).await.unwrap();
    let request = format!("GET /{path} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

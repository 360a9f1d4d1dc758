use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::sink::SinkExt;
use futures_util::stream::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tungstenite::protocol::Message;

use chat_relay::config::{ResponderKind, ServerConfig};
use chat_relay::responder::EchoResponder;
use chat_relay::server::delivery::RATE_LIMIT_NOTICE;
use chat_relay::server::{
    handle_connection, health, ConnectionRateLimiter, DeliveryEngine, HealthMetrics,
    HeartbeatMonitor, ServerState, SessionRegistry, ShutdownCoordinator, SlidingWindowLimiter,
};

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn test_config(max_messages: usize) -> ServerConfig {
    ServerConfig {
        port: 0,
        http_port: 0,
        max_connections: 64,
        connection_rate_limit: 10_000,
        rate_limit_max_messages: max_messages,
        rate_limit_window_secs: 60,
        heartbeat_interval_secs: 30,
        heartbeat_timeout_secs: 120,
        responder: ResponderKind::Echo,
        tls_cert_path: PathBuf::from("certs/cert.pem"),
        tls_key_path: PathBuf::from("certs/key.pem"),
        enable_tls: false,
    }
}

/// Spins up the WebSocket accept loop on an ephemeral port and returns
/// its address plus the shared state for direct assertions.
async fn start_server(max_messages: usize) -> (SocketAddr, Arc<ServerState>) {
    let config = test_config(max_messages);
    let registry = SessionRegistry::new();
    let limiter = SlidingWindowLimiter::new(
        config.rate_limit_max_messages,
        config.rate_limit_window(),
    );
    let metrics = HealthMetrics::new();
    let delivery = DeliveryEngine::new(registry.clone(), limiter.clone(), metrics.clone());

    let state = Arc::new(ServerState {
        conn_limiter: ConnectionRateLimiter::new(config.connection_rate_limit),
        config: Arc::new(config),
        registry,
        limiter,
        delivery,
        metrics,
        tls_acceptor: None,
        responder: Arc::new(EchoResponder),
        speech: None,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn({
        let state = state.clone();
        async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = handle_connection(stream, state, peer).await;
                });
            }
        }
    });

    (addr, state)
}

async fn connect(addr: SocketAddr, user_id: &str) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{}/?user_id={}", addr, user_id))
        .await
        .expect("client failed to connect");
    ws
}

/// Next text frame from the server, decoded. Panics after five seconds.
async fn next_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection ended unexpectedly")
            .expect("transport error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame was not valid JSON");
        }
    }
}

/// Reads frames until one matches, skipping unrelated room notices.
async fn wait_for(ws: &mut WsClient, pred: impl Fn(&Value) -> bool) -> Value {
    for _ in 0..16 {
        let frame = next_json(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
    panic!("expected frame never arrived");
}

async fn send_chat(ws: &mut WsClient, content: &str) {
    ws.send(Message::Text(
        serde_json::json!({ "content": content }).to_string(),
    ))
    .await
    .expect("send failed");
}

#[tokio::test]
async fn connect_receives_welcome_and_registers_session() {
    let (addr, state) = start_server(60).await;
    let mut alice = connect(addr, "alice").await;

    let welcome = next_json(&mut alice).await;
    assert_eq!(welcome["type"], "system");
    assert_eq!(welcome["severity"], "info");
    assert!(welcome["content"].as_str().unwrap().contains("alice"));
    assert_eq!(welcome["sender_id"], "system");
    assert_eq!(welcome["status"], "pending");

    assert_eq!(state.registry.active_users(), vec!["alice".to_string()]);
    let info = state.registry.session("alice").unwrap().info();
    assert_eq!(info.messages_sent, 0);
    // The welcome itself was delivered to the user.
    assert_eq!(info.messages_received, 1);
}

#[tokio::test]
async fn chat_flows_to_the_room_and_reply_returns_to_sender() {
    let (addr, _state) = start_server(60).await;
    let mut alice = connect(addr, "alice").await;
    next_json(&mut alice).await; // welcome

    let mut bob = connect(addr, "bob").await;
    next_json(&mut bob).await; // welcome
    wait_for(&mut alice, |v| {
        v["type"] == "system" && v["content"].as_str().unwrap_or("").contains("joined")
    })
    .await;

    send_chat(&mut alice, "hello bob").await;

    // The room sees alice's message...
    let received = wait_for(&mut bob, |v| v["type"] == "chat").await;
    assert_eq!(received["sender_id"], "alice");
    assert_eq!(received["content"], "hello bob");

    // ...and alice gets the responder's reply, threaded to her message.
    let reply = wait_for(&mut alice, |v| v["type"] == "chat").await;
    assert_eq!(reply["sender_id"], "assistant");
    assert_eq!(reply["agent_id"], "assistant");
    assert!(reply["content"].as_str().unwrap().contains("hello bob"));
    assert_eq!(reply["reply_to"], received["id"]);
}

#[tokio::test]
async fn malformed_json_yields_error_frame_not_disconnect() {
    let (addr, state) = start_server(60).await;
    let mut alice = connect(addr, "alice").await;
    next_json(&mut alice).await; // welcome

    alice
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    let reject = next_json(&mut alice).await;
    assert_eq!(reject["type"], "system");
    assert_eq!(reject["severity"], "error");
    assert!(reject["content"].as_str().unwrap().contains("Invalid message format"));

    // The connection survived and keeps working.
    send_chat(&mut alice, "still here").await;
    let reply = wait_for(&mut alice, |v| v["type"] == "chat").await;
    assert!(reply["content"].as_str().unwrap().contains("still here"));
    assert_eq!(state.registry.active_users(), vec!["alice".to_string()]);
}

#[tokio::test]
async fn throttled_sender_gets_one_policy_notice() {
    let (addr, _state) = start_server(2).await;
    let mut alice = connect(addr, "alice").await;
    next_json(&mut alice).await; // welcome

    for text in ["one", "two"] {
        send_chat(&mut alice, text).await;
        let reply = wait_for(&mut alice, |v| v["type"] == "chat").await;
        assert!(reply["content"].as_str().unwrap().contains(text));
    }

    // Window is full: the third message yields the policy notice only.
    send_chat(&mut alice, "three").await;
    let notice = next_json(&mut alice).await;
    assert_eq!(notice["type"], "system");
    assert_eq!(notice["severity"], "error");
    assert_eq!(notice["content"], RATE_LIMIT_NOTICE);
}

#[tokio::test]
async fn clean_disconnect_removes_user_and_notifies_room() {
    let (addr, state) = start_server(60).await;
    let mut alice = connect(addr, "alice").await;
    next_json(&mut alice).await; // welcome
    let mut bob = connect(addr, "bob").await;
    next_json(&mut bob).await; // welcome
    wait_for(&mut alice, |v| {
        v["content"].as_str().unwrap_or("").contains("joined")
    })
    .await;

    bob.close(None).await.unwrap();

    let leave = wait_for(&mut alice, |v| {
        v["content"].as_str().unwrap_or("").contains("left")
    })
    .await;
    assert!(leave["content"].as_str().unwrap().contains("bob"));

    for _ in 0..100 {
        if state.registry.active_users() == vec!["alice".to_string()] {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bob was never removed from the registry");
}

#[tokio::test]
async fn reconnect_replaces_the_prior_session() {
    let (addr, state) = start_server(60).await;
    let mut first = connect(addr, "alice").await;
    next_json(&mut first).await; // welcome

    let mut second = connect(addr, "alice").await;
    next_json(&mut second).await; // welcome on the new connection

    // The displaced connection is closed by the server.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old connection was not closed");

    for _ in 0..100 {
        if state.registry.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.registry.active_users(), vec!["alice".to_string()]);

    // The replacement session still works.
    send_chat(&mut second, "back again").await;
    let reply = wait_for(&mut second, |v| v["type"] == "chat").await;
    assert!(reply["content"].as_str().unwrap().contains("back again"));
}

#[tokio::test]
async fn heartbeat_probe_reaches_connected_clients() {
    let (addr, state) = start_server(60).await;
    let mut alice = connect(addr, "alice").await;
    next_json(&mut alice).await; // welcome

    let monitor = HeartbeatMonitor::new(
        state.registry.clone(),
        state.delivery.clone(),
        Duration::from_millis(100),
        Duration::from_secs(120),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = monitor.spawn(shutdown_rx);

    let probe = wait_for(&mut alice, |v| v["content"] == "heartbeat").await;
    assert_eq!(probe["type"], "system");
    assert_eq!(probe["severity"], "debug");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("monitor did not stop")
        .unwrap();
}

#[tokio::test]
async fn shutdown_drains_every_client() {
    let (addr, state) = start_server(60).await;
    let mut alice = connect(addr, "alice").await;
    next_json(&mut alice).await;
    let mut bob = connect(addr, "bob").await;
    next_json(&mut bob).await;

    let (coordinator, _shutdown_rx) =
        ShutdownCoordinator::new(state.registry.clone(), state.delivery.clone());
    coordinator.shutdown().await;

    for client in [&mut alice, &mut bob] {
        let warning = wait_for(client, |v| v["severity"] == "warning").await;
        assert!(warning["content"].as_str().unwrap().contains("shutting down"));
    }
    assert!(state.registry.is_empty());

    // Re-entrant: a second drain has nothing to do and does not panic.
    coordinator.shutdown().await;
    assert!(state.registry.is_empty());
}

/// One-shot HTTP request against the API listener, returning the raw
/// response text.
async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            format!(
                "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
                path
            )
            .as_bytes(),
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn session_query_endpoints_reflect_the_registry() {
    let (addr, state) = start_server(60).await;
    let mut alice = connect(addr, "alice").await;
    next_json(&mut alice).await; // welcome

    let http_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    http_listener.set_nonblocking(true).unwrap();
    let http_addr = http_listener.local_addr().unwrap();
    tokio::spawn(health::serve_http(state.clone(), http_listener));

    let users = http_get(http_addr, "/chat/active-users").await;
    assert!(users.contains("200 OK"));
    assert!(users.contains("alice"));

    let session = http_get(http_addr, "/chat/user-session/alice").await;
    assert!(session.contains("200 OK"));
    assert!(session.contains("\"messages_received\""));

    let missing = http_get(http_addr, "/chat/user-session/ghost").await;
    assert!(missing.contains("404"));

    let metrics = http_get(http_addr, "/metrics").await;
    assert!(metrics.contains("connections"));

    // No speech service wired in: voice endpoints decline politely.
    let mut stream = tokio::net::TcpStream::connect(http_addr).await.unwrap();
    stream
        .write_all(
            b"POST /voice/transcribe HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.contains("503"));
}

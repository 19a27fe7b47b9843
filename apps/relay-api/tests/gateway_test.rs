mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use relay_api::db::kv::{KeyValueStore, MemoryStore};
use relay_api::gateway::fanout::{BroadcastMedium, MemoryMedium};

type Ws =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Helper: open a socket, optionally resuming a session via the query string.
/// Returns the socket and the session id the server issued.
async fn connect(addr: SocketAddr, session_id: Option<&str>) -> (Ws, String) {
    let url = match session_id {
        Some(id) => format!("ws://{addr}/socket?session_id={id}"),
        None => format!("ws://{addr}/socket"),
    };
    let (ws, response) = tokio_tungstenite::connect_async(&url)
        .await
        .expect("ws connect");
    (ws, issued_session(&response))
}

/// Helper: the session id from the handshake's `Set-Cookie`.
fn issued_session(response: &tungstenite::handshake::client::Response) -> String {
    let cookie = response
        .headers()
        .get("set-cookie")
        .expect("session cookie")
        .to_str()
        .unwrap();
    assert!(cookie.contains("HttpOnly"), "cookie must not be script-readable");
    cookie
        .split(';')
        .next()
        .and_then(|pair| pair.strip_prefix("relay_sid="))
        .expect("relay_sid cookie")
        .to_string()
}

/// Helper: read the next text frame as JSON.
async fn next_event(ws: &mut Ws) -> Value {
    loop {
        let msg = time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for event")
            .expect("stream ended")
            .expect("ws read error");
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("parse event");
        }
    }
}

/// Helper: assert nothing arrives for a short while.
async fn expect_silence(ws: &mut Ws) {
    if let Ok(frame) = time::timeout(Duration::from_millis(300), ws.next()).await {
        panic!("expected no frames, got: {frame:?}");
    }
}

async fn send_event(ws: &mut Ws, t: &str, d: Value) {
    let frame = serde_json::json!({ "t": t, "d": d });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// Helper: connect and read `sessionStatus`. Returns the socket and session id.
async fn connect_fresh(addr: SocketAddr) -> (Ws, String) {
    let (mut ws, session_id) = connect(addr, None).await;
    let status = next_event(&mut ws).await;
    assert_eq!(status["t"], "sessionStatus");
    (ws, session_id)
}

/// Helper: register and return the `permissionStatus` payload.
async fn register(ws: &mut Ws, username: &str) -> Value {
    send_event(ws, "register", Value::from(username)).await;
    let perm = next_event(ws).await;
    assert_eq!(perm["t"], "permissionStatus");
    if perm["d"]["canReceive"] == true {
        let login = next_event(ws).await;
        assert_eq!(login["t"], "loginConfirmed");
        assert_eq!(login["d"]["username"], username);
    }
    perm["d"].clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_reports_fresh_session() {
    let addr = common::start_server(common::test_state().await).await;
    let (mut ws, session_id) = connect(addr, None).await;
    assert!(session_id.starts_with("sess_"));

    let status = next_event(&mut ws).await;
    assert_eq!(status["t"], "sessionStatus");
    assert_eq!(
        status["d"],
        serde_json::json!({ "loggedIn": false, "canSend": false })
    );
}

#[tokio::test]
async fn classroom_scenario() {
    let addr = common::start_server(common::test_state().await).await;

    let (mut alice, _) = connect_fresh(addr).await;
    let (mut bob, _) = connect_fresh(addr).await;
    let (mut carol, _) = connect_fresh(addr).await;

    let perm = register(&mut alice, "alice").await;
    assert_eq!(perm, serde_json::json!({ "canReceive": true, "canSend": true }));

    let perm = register(&mut bob, "bob").await;
    assert_eq!(perm, serde_json::json!({ "canReceive": true, "canSend": false }));

    let perm = register(&mut carol, "carol").await;
    assert_eq!(perm, serde_json::json!({ "canReceive": false, "canSend": false }));
    // No loginConfirmed for carol.
    expect_silence(&mut carol).await;

    // Bob may not send; carol is not registered at all.
    send_event(&mut bob, "sendMessage", Value::from("hi")).await;
    send_event(&mut carol, "sendMessage", Value::from("let me in")).await;
    send_event(&mut alice, "sendMessage", Value::from("hello")).await;

    for ws in [&mut alice, &mut bob] {
        let msg = next_event(ws).await;
        assert_eq!(msg["t"], "incomingMessage");
        assert_eq!(msg["d"], "alice: hello");
    }

    // Nothing from bob or carol was ever published, and carol receives nothing.
    expect_silence(&mut alice).await;
    expect_silence(&mut bob).await;
    expect_silence(&mut carol).await;
}

#[tokio::test]
async fn message_crosses_processes() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let medium: Arc<dyn BroadcastMedium> = Arc::new(MemoryMedium::new());

    let addr_a = common::start_server(common::process_state(kv.clone(), medium.clone()).await).await;
    let addr_b = common::start_server(common::process_state(kv, medium).await).await;

    let (mut alice, _) = connect_fresh(addr_a).await;
    let (mut bob, _) = connect_fresh(addr_b).await;
    let (mut teacher_b, _) = connect_fresh(addr_b).await;
    register(&mut alice, "alice").await;
    register(&mut bob, "bob").await;
    register(&mut teacher_b, "alice").await;

    send_event(&mut alice, "sendMessage", Value::from("from A")).await;

    for ws in [&mut alice, &mut bob, &mut teacher_b] {
        let msg = next_event(ws).await;
        assert_eq!(msg["t"], "incomingMessage");
        assert_eq!(msg["d"], "alice: from A");
    }
}

#[tokio::test]
async fn reconnect_restores_registration() {
    let addr = common::start_server(common::test_state().await).await;

    let (mut first, session_id) = connect_fresh(addr).await;
    register(&mut first, "alice").await;
    first.close(None).await.ok();

    let (mut second, resumed) = connect(addr, Some(&session_id)).await;
    assert_eq!(resumed, session_id);
    let status = next_event(&mut second).await;
    assert_eq!(status["t"], "sessionStatus");
    assert_eq!(status["d"]["loggedIn"], true);
    assert_eq!(status["d"]["canSend"], true);

    // Registered without registering again: can send and receive.
    send_event(&mut second, "sendMessage", Value::from("back")).await;
    let msg = next_event(&mut second).await;
    assert_eq!(msg["d"], "alice: back");
}

#[tokio::test]
async fn downgrade_on_shared_session_stops_other_socket() {
    let addr = common::start_server(common::test_state().await).await;

    let (mut first, session_id) = connect_fresh(addr).await;
    register(&mut first, "alice").await;

    let (mut second, _) = connect(addr, Some(&session_id)).await;
    let status = next_event(&mut second).await;
    assert_eq!(status["d"]["canSend"], true);

    let perm = register(&mut first, "bob").await;
    assert_eq!(perm["canSend"], false);

    send_event(&mut second, "sendMessage", Value::from("still here")).await;
    expect_silence(&mut first).await;
    expect_silence(&mut second).await;
}

#[tokio::test]
async fn reconnect_via_cookie_on_another_process() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let medium: Arc<dyn BroadcastMedium> = Arc::new(MemoryMedium::new());
    let addr_a = common::start_server(common::process_state(kv.clone(), medium.clone()).await).await;
    let addr_b = common::start_server(common::process_state(kv, medium).await).await;

    let (mut first, session_id) = connect_fresh(addr_a).await;
    register(&mut first, "bob").await;
    first.close(None).await.ok();

    let mut request = format!("ws://{addr_b}/socket").into_client_request().unwrap();
    request.headers_mut().insert(
        "cookie",
        format!("theme=dark; relay_sid={session_id}").parse().unwrap(),
    );
    let (mut second, response) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    assert_eq!(issued_session(&response), session_id);

    let status = next_event(&mut second).await;
    assert_eq!(status["d"]["loggedIn"], true);
    assert_eq!(status["d"]["canSend"], false);
}

#[tokio::test]
async fn unknown_session_id_starts_over() {
    let addr = common::start_server(common::test_state().await).await;
    let (mut ws, issued) = connect(addr, Some("sess_01ARZ3NDEKTSV4RRFFQ69G5FAV")).await;
    assert_ne!(issued, "sess_01ARZ3NDEKTSV4RRFFQ69G5FAV");

    let status = next_event(&mut ws).await;
    assert_eq!(status["d"]["loggedIn"], false);
}

#[tokio::test]
async fn malformed_frames_are_ignored() {
    let addr = common::start_server(common::test_state().await).await;
    let (mut ws, _) = connect_fresh(addr).await;

    ws.send(tungstenite::Message::Text("not json".into()))
        .await
        .unwrap();
    send_event(&mut ws, "register", Value::from(42)).await;
    send_event(&mut ws, "sendMessage", serde_json::json!({ "text": "x" })).await;
    send_event(&mut ws, "shout", Value::from("x")).await;
    send_event(&mut ws, "register", Value::from("")).await;
    expect_silence(&mut ws).await;

    // Connection is still usable.
    let perm = register(&mut ws, "alice").await;
    assert_eq!(perm["canSend"], true);
}

#[tokio::test]
async fn disconnected_clients_leave_the_fan_out_set() {
    let state = common::test_state().await;
    let addr = common::start_server(state.clone()).await;

    let (mut alice, _) = connect_fresh(addr).await;
    register(&mut alice, "alice").await;
    assert_eq!(state.router.len(), 1);

    alice.close(None).await.ok();
    drop(alice);

    for _ in 0..50 {
        if state.router.is_empty() {
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection was not removed after disconnect");
}

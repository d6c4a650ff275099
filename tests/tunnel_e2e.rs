//! End-to-end tests: run the tunnel agent against an in-process WebSocket
//! controller and drive the session protocol over a real socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use edgeterm::{Config, Tunnel};

type ServerWs = WebSocketStream<TcpStream>;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Start a tunnel agent pointed at the given local port, with `/bin/sh`
/// sessions.
fn start_tunnel(port: u16) -> Tunnel {
    let config = Config::from_json(&format!(
        r#"{{"cloud":"ws://127.0.0.1:{port}/terminal","command":"/bin/sh"}}"#
    ))
    .expect("valid test config");
    let tunnel = Tunnel::new(config);
    let runner = tunnel.clone();
    tokio::spawn(async move { runner.run().await });
    tunnel
}

/// Accept the agent's next connection as the fake controller.
async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("timed out waiting for tunnel connection")
        .expect("accept failed");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket handshake failed")
}

async fn send_text(ws: &mut ServerWs, text: &str) {
    ws.send(Message::Text(text.to_string()))
        .await
        .expect("server send failed");
}

/// Read frames until one parses as JSON and satisfies the predicate.
async fn wait_for_envelope(ws: &mut ServerWs, predicate: impl Fn(&Value) -> bool) -> Value {
    loop {
        let frame = timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for envelope")
            .expect("connection ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).expect("agent sent invalid JSON");
            if predicate(&value) {
                return value;
            }
        }
    }
}

/// Accumulate `output` payloads for a session until the collected text
/// contains `needle`.
async fn wait_for_output(ws: &mut ServerWs, session_id: &str, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        let envelope = wait_for_envelope(ws, |v| v["type"] == "output").await;
        assert_eq!(envelope["sessionID"], session_id);
        seen.push_str(envelope["payload"].as_str().expect("output payload is a string"));
    }
    seen
}

/// Assert that no text frame arrives within the window.
async fn assert_silence(ws: &mut ServerWs, window: Duration) {
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => panic!("expected silence, agent sent: {text}"),
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) | Err(_) => return,
        }
    }
}

#[tokio::test]
async fn session_lifecycle_start_input_resize_end() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tunnel = start_tunnel(port);
    let mut ws = accept(&listener).await;

    // start → terminal created, no acknowledgment expected
    send_text(&mut ws, r#"{"type":"start","sessionID":"s1","payload":""}"#).await;

    // input → output envelopes carrying the command's result
    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"s1","payload":"echo e2e-check\n"}"#,
    )
    .await;
    wait_for_output(&mut ws, "s1", "e2e-check").await;

    // resize → accepted silently
    send_text(
        &mut ws,
        r#"{"type":"resize","sessionID":"s1","payload":{"width":120,"height":40}}"#,
    )
    .await;

    // malformed resize → dropped, session must stay alive
    send_text(
        &mut ws,
        r#"{"type":"resize","sessionID":"s1","payload":{"width":-1,"height":40}}"#,
    )
    .await;
    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"s1","payload":"echo still-alive\n"}"#,
    )
    .await;
    wait_for_output(&mut ws, "s1", "still-alive").await;

    // end → terminal killed, agent notifies with an end envelope echoing
    // the session ID as payload
    send_text(&mut ws, r#"{"type":"end","sessionID":"s1","payload":""}"#).await;
    let end = wait_for_envelope(&mut ws, |v| v["type"] == "end").await;
    assert_eq!(end["sessionID"], "s1");
    assert_eq!(end["payload"], "s1");

    tunnel.close().await;
}

#[tokio::test]
async fn duplicate_start_is_dropped_and_end_fires_once() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tunnel = start_tunnel(port);
    let mut ws = accept(&listener).await;

    send_text(&mut ws, r#"{"type":"start","sessionID":"s1","payload":""}"#).await;
    // Second start for a live session is a peer bug; it must be dropped
    // without disturbing the existing terminal.
    send_text(&mut ws, r#"{"type":"start","sessionID":"s1","payload":""}"#).await;

    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"s1","payload":"echo one-terminal\n"}"#,
    )
    .await;
    wait_for_output(&mut ws, "s1", "one-terminal").await;

    send_text(&mut ws, r#"{"type":"end","sessionID":"s1","payload":""}"#).await;
    let end = wait_for_envelope(&mut ws, |v| v["type"] == "end").await;
    assert_eq!(end["sessionID"], "s1");

    // Exactly one end envelope: the channel stays quiet afterwards.
    let mut extra_ends = 0;
    while let Ok(Some(Ok(frame))) = timeout(Duration::from_secs(1), ws.next()).await {
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == "end" {
                extra_ends += 1;
            }
        }
    }
    assert_eq!(extra_ends, 0);

    tunnel.close().await;
}

#[tokio::test]
async fn messages_for_unknown_sessions_are_dropped() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tunnel = start_tunnel(port);
    let mut ws = accept(&listener).await;

    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"ghost","payload":"echo nope\n"}"#,
    )
    .await;
    send_text(
        &mut ws,
        r#"{"type":"resize","sessionID":"ghost","payload":{"width":80,"height":24}}"#,
    )
    .await;
    send_text(&mut ws, r#"{"type":"end","sessionID":"ghost","payload":""}"#).await;
    assert_silence(&mut ws, Duration::from_secs(1)).await;

    // The tunnel must still be fully functional.
    send_text(&mut ws, r#"{"type":"start","sessionID":"s1","payload":""}"#).await;
    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"s1","payload":"echo alive\n"}"#,
    )
    .await;
    wait_for_output(&mut ws, "s1", "alive").await;

    tunnel.close().await;
}

#[tokio::test]
async fn malformed_envelopes_do_not_disturb_the_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tunnel = start_tunnel(port);
    let mut ws = accept(&listener).await;

    send_text(&mut ws, "not json at all").await;
    send_text(&mut ws, r#"{"type":"launch","sessionID":"s1","payload":""}"#).await;
    send_text(
        &mut ws,
        r#"{"type":"start","sessionID":"s1","payload":"","extra":1}"#,
    )
    .await;
    send_text(&mut ws, r#"{"type":"output","sessionID":"s1","payload":"x"}"#).await;
    assert_silence(&mut ws, Duration::from_secs(1)).await;

    send_text(&mut ws, r#"{"type":"start","sessionID":"s1","payload":""}"#).await;
    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"s1","payload":"echo recovered\n"}"#,
    )
    .await;
    wait_for_output(&mut ws, "s1", "recovered").await;

    tunnel.close().await;
}

#[tokio::test]
async fn reconnects_after_disconnect_and_sessions_do_not_survive() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tunnel = start_tunnel(port);

    let mut ws = accept(&listener).await;
    send_text(&mut ws, r#"{"type":"start","sessionID":"s1","payload":""}"#).await;
    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"s1","payload":"echo first-life\n"}"#,
    )
    .await;
    wait_for_output(&mut ws, "s1", "first-life").await;

    // Drop the connection; the agent reconnects after backoff (1s first).
    drop(ws);
    let mut ws = accept(&listener).await;

    // The old session died with the old connection: input for it is dropped.
    send_text(
        &mut ws,
        r#"{"type":"input","sessionID":"s1","payload":"echo zombie\n"}"#,
    )
    .await;
    assert_silence(&mut ws, Duration::from_secs(1)).await;

    tunnel.close().await;
}

#[tokio::test]
async fn close_prevents_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let tunnel = start_tunnel(port);

    let ws = accept(&listener).await;
    tunnel.close().await;
    drop(ws);

    // With exiting set, no new connection may be attempted (the first
    // backoff would land well inside this window).
    assert!(
        timeout(Duration::from_millis(2500), listener.accept())
            .await
            .is_err(),
        "agent reconnected after close"
    );
}

//! End-to-end tests against an in-process STOMP-over-WebSocket server.
//!
//! The server half is scripted per test: accept, answer the CONNECT
//! handshake, verify the two channel subscriptions, then deliver frames.
//! This exercises the full client stack — transport, handshake, routing,
//! store, watcher — over a real socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use opwatch::stomp::{self, Command, Frame};
use opwatch::{ConnectionConfig, ProgressWatcher, TerminalNotice};

type ServerWs = WebSocketStream<TcpStream>;

/// Bind a listener and return it with the matching client-side server URL.
async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("binds");
    let addr = listener.local_addr().expect("has addr");
    (listener, format!("http://{addr}"))
}

/// Connection parameters tuned for fast test reconnects.
fn test_connection(server_url: &str) -> ConnectionConfig {
    connection_with_heartbeat(server_url, 4000)
}

fn connection_with_heartbeat(server_url: &str, heartbeat_ms: u64) -> ConnectionConfig {
    ConnectionConfig::new(server_url, Duration::from_millis(100), heartbeat_ms)
}

/// Accept one WebSocket connection and run the STOMP handshake.
/// Heart-beats are disabled server-side to keep the scripts deterministic.
async fn accept_stomp(listener: &TcpListener) -> ServerWs {
    accept_stomp_with(listener, "4000,4000", "0,0").await
}

/// Handshake variant asserting the client's heart-beat offer and answering
/// with a chosen server-side pair.
async fn accept_stomp_with(
    listener: &TcpListener,
    expect_client_beat: &str,
    server_beat: &str,
) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accepts");
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket handshake");

    let connect = next_frame(&mut ws).await;
    assert_eq!(connect.command, Command::Connect);
    assert_eq!(connect.header("accept-version"), Some("1.2"));
    assert_eq!(connect.header("heart-beat"), Some(expect_client_beat));

    let connected = Frame::new(Command::Connected)
        .with_header("version", "1.2")
        .with_header("heart-beat", server_beat);
    ws.send(Message::Text(connected.encode()))
        .await
        .expect("sends CONNECTED");
    ws
}

/// Read the next STOMP frame, skipping heart-beats and answering pings.
async fn next_frame(ws: &mut ServerWs) -> Frame {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                if stomp::is_heartbeat(&text) {
                    continue;
                }
                return Frame::parse(&text).expect("client sends valid frames");
            }
            Some(Ok(Message::Ping(data))) => {
                ws.send(Message::Pong(data)).await.expect("sends pong");
            }
            Some(Ok(_)) => continue,
            other => panic!("connection ended while expecting a frame: {other:?}"),
        }
    }
}

/// Verify the client subscribed to exactly its two channels.
async fn expect_subscriptions(ws: &mut ServerWs, user: &str) {
    let mut ids = Vec::new();
    for _ in 0..2 {
        let frame = next_frame(ws).await;
        assert_eq!(frame.command, Command::Subscribe);
        let id = frame.header("id").expect("has id").to_string();
        let destination = frame
            .header("destination")
            .expect("has destination")
            .to_string();
        match id.as_str() {
            "sub-private" => assert_eq!(destination, format!("/topic/progress.{user}")),
            "sub-public" => assert_eq!(destination, "/topic/system"),
            other => panic!("unexpected subscription id {other}"),
        }
        ids.push(id);
    }
    assert_ne!(ids[0], ids[1], "each channel subscribed exactly once");
}

/// Deliver a MESSAGE frame on a subscription.
async fn send_message(ws: &mut ServerWs, sub_id: &str, body: &str) {
    let frame = Frame::new(Command::Message)
        .with_header("subscription", sub_id)
        .with_header("message-id", "m-0")
        .with_header("destination", "/ignored")
        .with_body(body);
    ws.send(Message::Text(frame.encode()))
        .await
        .expect("sends MESSAGE");
}

/// Block until the watcher's store holds at least `n` events.
async fn wait_for_events(watcher: &ProgressWatcher, n: usize) {
    let mut rx = watcher.store_changes().expect("session exists");
    tokio::time::timeout(Duration::from_secs(5), async {
        while watcher.events().len() < n {
            rx.changed().await.expect("store alive");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {n} events"));
}

#[tokio::test]
async fn test_full_progress_scenario() {
    let (listener, server_url) = bind_server().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_stomp(&listener).await;
        expect_subscriptions(&mut ws, "alice").await;

        send_message(
            &mut ws,
            "sub-private",
            r#"{"userId":"alice","operationId":"op1","type":"GENERATION_STARTED",
               "message":"begin","timestamp":1000}"#,
        )
        .await;
        send_message(
            &mut ws,
            "sub-public",
            r#"{"type":"SYSTEM","message":"maintenance","timestamp":2000}"#,
        )
        .await;
        send_message(
            &mut ws,
            "sub-private",
            r#"{"userId":"alice","operationId":"op1","type":"GENERATION_COMPLETED",
               "message":"done","percentage":100,"timestamp":3000}"#,
        )
        .await;

        // Hold the connection open until the client is done asserting
        let _ = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
    });

    let mut watcher = ProgressWatcher::new(test_connection(&server_url));
    watcher.observe("alice");
    watcher.set_operation(Some("op1"));

    wait_for_events(&watcher, 3).await;

    let all = watcher.events();
    assert_eq!(all.len(), 3);
    let messages: Vec<&str> = all.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["begin", "maintenance", "done"]);

    assert_eq!(watcher.private_updates().len(), 2);
    assert_eq!(watcher.public_updates().len(), 1);

    let latest = watcher.current_status().expect("has status");
    assert_eq!(latest.message, "done");
    assert_eq!(latest.percentage, Some(100));

    // Exactly one completion notice
    assert_eq!(
        watcher.take_terminal_notice(),
        Some(TerminalNotice::Success("done".to_string()))
    );
    assert_eq!(watcher.take_terminal_notice(), None);

    assert!(watcher.connection_state().is_connected());

    watcher.stop();
    server.await.expect("server task");
}

#[tokio::test]
async fn test_malformed_frame_dropped_without_disconnecting() {
    let (listener, server_url) = bind_server().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_stomp(&listener).await;
        expect_subscriptions(&mut ws, "alice").await;

        send_message(
            &mut ws,
            "sub-private",
            r#"{"userId":"alice","operationId":"op1","type":"GENERATION_STARTED",
               "message":"first","timestamp":0}"#,
        )
        .await;
        // Malformed payload between two valid frames
        send_message(&mut ws, "sub-private", "{this is not json").await;
        send_message(
            &mut ws,
            "sub-private",
            r#"{"userId":"alice","operationId":"op1","type":"GENERATION_PROGRESS",
               "message":"second","timestamp":0}"#,
        )
        .await;

        let _ = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
    });

    let mut watcher = ProgressWatcher::new(test_connection(&server_url));
    watcher.observe("alice");

    wait_for_events(&watcher, 2).await;

    let all = watcher.events();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].message, "first");
    assert_eq!(all[1].message, "second");

    let connection = watcher.session().expect("session").connection();
    assert_eq!(connection.decode_faults(), 1);
    assert!(connection.state().is_connected());

    watcher.stop();
    server.await.expect("server task");
}

#[tokio::test]
async fn test_reconnect_resubscribes_both_channels() {
    let (listener, server_url) = bind_server().await;

    let server = tokio::spawn(async move {
        // First connection: one event, then an abrupt drop
        let mut ws = accept_stomp(&listener).await;
        expect_subscriptions(&mut ws, "alice").await;
        send_message(
            &mut ws,
            "sub-private",
            r#"{"userId":"alice","operationId":"op1","type":"GENERATION_STARTED",
               "message":"before drop","timestamp":0}"#,
        )
        .await;
        drop(ws);

        // Second connection: subscriptions must be re-issued, then frames
        // sent post-resubscription arrive exactly once
        let mut ws = accept_stomp(&listener).await;
        expect_subscriptions(&mut ws, "alice").await;
        send_message(
            &mut ws,
            "sub-public",
            r#"{"type":"SYSTEM","message":"after reconnect","timestamp":0}"#,
        )
        .await;

        let _ = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
    });

    let mut watcher = ProgressWatcher::new(test_connection(&server_url));
    watcher.observe("alice");

    wait_for_events(&watcher, 2).await;

    // Already-stored events are not reordered or duplicated by the reconnect
    let all = watcher.events();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].message, "before drop");
    assert_eq!(all[1].message, "after reconnect");

    watcher.stop();
    server.await.expect("server task");
}

#[tokio::test]
async fn test_silent_server_triggers_reconnect() {
    let (listener, server_url) = bind_server().await;

    let server = tokio::spawn(async move {
        // First connection negotiates 100 ms heart-beats in both directions,
        // then the server goes silent without closing. The client must treat
        // the silence as a dead link and drop the connection itself.
        let mut ws = accept_stomp_with(&listener, "100,100", "100,100").await;
        expect_subscriptions(&mut ws, "alice").await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(msg) = ws.next().await {
                if msg.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("client abandons the silent connection");

        // Second connection: heart-beats disabled, so it stays healthy
        let mut ws = accept_stomp_with(&listener, "100,100", "0,0").await;
        expect_subscriptions(&mut ws, "alice").await;
        send_message(
            &mut ws,
            "sub-private",
            r#"{"userId":"alice","operationId":"op1","type":"GENERATION_STARTED",
               "message":"after silence","timestamp":0}"#,
        )
        .await;

        let _ = tokio::time::timeout(Duration::from_secs(5), ws.next()).await;
    });

    let mut watcher = ProgressWatcher::new(connection_with_heartbeat(&server_url, 100));
    watcher.observe("alice");

    // The silent link surfaces as an Errored state carrying the timeout
    let mut state_rx = watcher.state_changes().expect("session exists");
    let errored = tokio::time::timeout(
        Duration::from_secs(5),
        state_rx.wait_for(|s| matches!(s, opwatch::ConnectionState::Errored(_))),
    )
    .await
    .expect("detects the silent failure")
    .expect("state channel alive");
    match &*errored {
        opwatch::ConnectionState::Errored(reason) => {
            assert!(reason.contains("heart-beat"), "unexpected reason: {reason}");
        }
        other => panic!("expected Errored, got {other:?}"),
    }
    drop(errored);

    // Reconnects, re-subscribes, and keeps receiving
    wait_for_events(&watcher, 1).await;
    assert_eq!(watcher.events()[0].message, "after silence");
    assert!(watcher.connection_state().is_connected());

    watcher.stop();
    server.await.expect("server task");
}

#[tokio::test]
async fn test_close_unsubscribes_and_disconnects() {
    let (listener, server_url) = bind_server().await;

    let server = tokio::spawn(async move {
        let mut ws = accept_stomp(&listener).await;
        expect_subscriptions(&mut ws, "alice").await;

        // Graceful close: both UNSUBSCRIBEs then DISCONNECT
        let first = next_frame(&mut ws).await;
        let second = next_frame(&mut ws).await;
        assert_eq!(first.command, Command::Unsubscribe);
        assert_eq!(second.command, Command::Unsubscribe);
        let mut ids = [
            first.header("id").expect("has id"),
            second.header("id").expect("has id"),
        ];
        ids.sort_unstable();
        assert_eq!(ids, ["sub-private", "sub-public"]);

        let disconnect = next_frame(&mut ws).await;
        assert_eq!(disconnect.command, Command::Disconnect);
    });

    let mut watcher = ProgressWatcher::new(test_connection(&server_url));
    watcher.observe("alice");

    // Wait until the session is actually connected before closing
    let mut state_rx = watcher.state_changes().expect("session exists");
    tokio::time::timeout(
        Duration::from_secs(5),
        state_rx.wait_for(opwatch::ConnectionState::is_connected),
    )
    .await
    .expect("connects")
    .expect("state channel alive");

    watcher.stop();
    server.await.expect("server saw graceful close");
}

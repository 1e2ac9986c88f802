//! End-to-end gateway tests
//!
//! Each test stands up a real gateway on an ephemeral port over the
//! in-process transport and talks to it with a plain WebSocket client, so
//! the full path is exercised: socket, protocol parsing, channel
//! registries, broker round trip, fan-out.

use futures::{FutureExt, SinkExt, StreamExt};
use relaybus::broker::{Broker, MemoryTransport};
use relaybus::gateway::{GatewayConfig, WebSocketGateway};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_gateway(config: GatewayConfig) -> (WebSocketGateway, String) {
    let (transport, events) = MemoryTransport::new();
    let broker = Broker::new(transport, events);
    let gateway = WebSocketGateway::new(
        broker,
        GatewayConfig {
            port: Some(0),
            ..config
        },
    );
    let addr = gateway.start().await.unwrap();
    let url = format!("ws://{}/ws", addr);
    (gateway, url)
}

async fn connect(url: &str) -> WsClient {
    let (ws, _response) = connect_async(url).await.expect("websocket connect failed");
    ws
}

async fn send_text(ws: &mut WsClient, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Next JSON text frame, skipping protocol-level pings.
async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_subscribe_acks_joined_channels() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, r#"{"type":"subscribe","channels":["a","b"]}"#).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["action"], "subscribe");
    assert_eq!(ack["channels"], json!(["a", "b"]));

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_repeat_subscribe_only_acks_new_channels() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, r#"{"type":"subscribe","channels":["a"]}"#).await;
    assert_eq!(recv_json(&mut ws).await["channels"], json!(["a"]));

    // "a" is already held, so only "b" shows up in the ack
    send_text(&mut ws, r#"{"type":"subscribe","channels":["a","b"]}"#).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["channels"], json!(["b"]));

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_server_publish_reaches_subscribed_client() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, r#"{"type":"subscribe","channels":["room:1"]}"#).await;
    recv_json(&mut ws).await;

    let delivered = gateway.publish("room:1", json!({"x": 1})).await.unwrap();
    assert_eq!(delivered, 1);

    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["channel"], "room:1");
    assert_eq!(frame["payload"], json!({"x": 1}));
    assert_eq!(frame["origin"], gateway.server_id());
    assert!(frame["timestamp"].as_i64().unwrap() > 0);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_publish_fans_out_to_channel_members() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut publisher = connect(&url).await;
    let mut listener = connect(&url).await;

    send_text(&mut listener, r#"{"type":"subscribe","channels":["room:1"]}"#).await;
    recv_json(&mut listener).await;

    send_text(
        &mut publisher,
        r#"{"type":"publish","channel":"room:1","payload":{"hello":"world"}}"#,
    )
    .await;

    let frame = recv_json(&mut listener).await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["payload"], json!({"hello": "world"}));
    assert_eq!(frame["origin"], gateway.server_id());

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_publish_can_be_forbidden() {
    let (gateway, url) = start_gateway(GatewayConfig {
        allow_client_publish: false,
        ..GatewayConfig::default()
    })
    .await;
    let mut ws = connect(&url).await;

    send_text(
        &mut ws,
        r#"{"type":"publish","channel":"room:1","payload":1}"#,
    )
    .await;
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "CLIENT_PUBLISH_FORBIDDEN");

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, r#"{"type":"subscribe","channels":["room:1"]}"#).await;
    recv_json(&mut ws).await;

    send_text(&mut ws, r#"{"type":"unsubscribe","channels":["room:1"]}"#).await;
    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["action"], "unsubscribe");
    assert_eq!(ack["channels"], json!(["room:1"]));

    // With no members left the upstream subscription is gone entirely
    assert_eq!(gateway.publish("room:1", json!(1)).await.unwrap(), 0);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_keeps_connection() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, "not-json").await;
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "INVALID_MESSAGE");

    // The connection survives and keeps serving
    send_text(&mut ws, r#"{"type":"ping"}"#).await;
    assert_eq!(recv_json(&mut ws).await["type"], "pong");

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_message_type_gets_distinct_error() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, r#"{"type":"teleport"}"#).await;
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["code"], "UNKNOWN_MESSAGE_TYPE");

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_ping_pong() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, r#"{"type":"ping"}"#).await;
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "pong");
    assert!(frame["timestamp"].as_i64().unwrap() > 0);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_handshake_validator_rejects_with_close_4001() {
    let (gateway, url) = start_gateway(GatewayConfig {
        handshake_validator: Some(Arc::new(|_request| {
            futures::future::ready(Err(anyhow::anyhow!("no token"))).boxed()
        })),
        ..GatewayConfig::default()
    })
    .await;

    // The HTTP upgrade itself succeeds; rejection arrives as a close frame
    let mut ws = connect(&url).await;
    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("connection ended without a close frame")
        .expect("websocket error");
    match frame {
        Message::Close(Some(close)) => assert_eq!(u16::from(close.code), 4001),
        other => panic!("unexpected frame: {:?}", other),
    }
    assert_eq!(gateway.connection_count(), 0);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_identify_client_is_consulted() {
    let called = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let observed = called.clone();
    let (gateway, url) = start_gateway(GatewayConfig {
        identify_client: Some(Arc::new(move |_request| {
            observed.store(true, std::sync::atomic::Ordering::SeqCst);
            futures::future::ready("user-42".to_string()).boxed()
        })),
        ..GatewayConfig::default()
    })
    .await;

    let mut ws = connect(&url).await;
    send_text(&mut ws, r#"{"type":"ping"}"#).await;
    recv_json(&mut ws).await;

    assert!(called.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(gateway.connection_count(), 1);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_unresponsive_client_is_evicted_by_heartbeat() {
    let (gateway, url) = start_gateway(GatewayConfig {
        heartbeat_interval: Duration::from_millis(1000),
        ..GatewayConfig::default()
    })
    .await;

    // Connect but never read, so the client can never answer a ping
    let _ws = connect(&url).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.connection_count(), 1);

    // Sweep one probes, sweep two evicts
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(gateway.connection_count(), 0);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_terminates_clients_and_clears_state() {
    let (gateway, url) = start_gateway(GatewayConfig::default()).await;
    let mut ws = connect(&url).await;

    send_text(&mut ws, r#"{"type":"subscribe","channels":["room:1"]}"#).await;
    recv_json(&mut ws).await;

    gateway.stop().await.unwrap();
    assert_eq!(gateway.connection_count(), 0);

    // The socket ends shortly after; a close frame, an error, or a bare
    // EOF are all acceptable shapes for the teardown
    let ended = timeout(Duration::from_secs(2), async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    // Stopping again is a no-op
    gateway.stop().await.unwrap();
}

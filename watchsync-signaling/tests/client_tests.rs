//! WebSocket client tests against a local in-process server

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use watchsync_signaling::*;

async fn spawn_server(
    frames: Vec<String>,
) -> (String, tokio::sync::oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, received_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = received_tx.send(text);
                break;
            }
        }
    });

    (format!("ws://{}", addr), received_rx)
}

#[tokio::test]
async fn test_client_skips_malformed_frames() {
    let (url, _received) = spawn_server(vec![
        r#"{"kind":"welcome","payload":{"connectionId":"self-1"}}"#.to_string(),
        "not json".to_string(),
        r#"{"kind":"roster","payload":[{"connectionId":"self-1","nickname":"Me"}]}"#.to_string(),
    ])
    .await;

    let (_client, mut inbound) = SignalingClient::connect(&url).await.unwrap();

    assert_eq!(
        inbound.recv().await,
        Some(InboundMessage::Welcome(Welcome {
            connection_id: "self-1".to_string()
        }))
    );
    let Some(InboundMessage::Roster(roster)) = inbound.recv().await else {
        panic!("Expected roster after the malformed frame");
    };
    assert_eq!(roster[0].nickname, "Me");
}

#[tokio::test]
async fn test_client_sends_json_frames() {
    let (url, received) = spawn_server(vec![]).await;
    let (client, _inbound) = SignalingClient::connect(&url).await.unwrap();

    client
        .send(OutboundMessage::CameraState(CameraStateMessage {
            connection_id: "self-1".to_string(),
            enabled: true,
        }))
        .await
        .unwrap();

    let text = received.await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["kind"], "camera-state");
    assert_eq!(value["payload"]["connectionId"], "self-1");
    assert_eq!(value["payload"]["enabled"], true);
}

#[tokio::test]
async fn test_connect_failure_is_signaling_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let result = SignalingClient::connect(&format!("ws://{}", addr)).await;
    assert_eq!(result.err().unwrap().error_code(), "SIGNALING_ERROR");
}

/// Server that closes its first connection right after the welcome and
/// greets the second one with another welcome
async fn spawn_restarting_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for id in ["conn-1", "conn-2"] {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let welcome = format!(r#"{{"kind":"welcome","payload":{{"connectionId":"{}"}}}}"#, id);
            ws.send(Message::Text(welcome)).await.unwrap();
            if id == "conn-1" {
                ws.close(None).await.unwrap();
            }
            while let Some(Ok(_)) = ws.next().await {}
        }
    });
    format!("ws://{}", addr)
}

fn welcome(id: &str) -> InboundMessage {
    InboundMessage::Welcome(Welcome {
        connection_id: id.to_string(),
    })
}

#[tokio::test]
async fn test_client_reconnects_after_server_close() {
    let url = spawn_restarting_server().await;
    let policy = ReconnectPolicy {
        delay: Duration::from_millis(20),
        max_attempts: Some(5),
    };
    let (_client, mut inbound) = SignalingClient::connect_with(&url, policy).await.unwrap();

    let mut received = Vec::new();
    for _ in 0..4 {
        let message = tokio::time::timeout(Duration::from_secs(10), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        received.push(message);
    }
    assert_eq!(
        received,
        vec![
            welcome("conn-1"),
            InboundMessage::ConnectionLost,
            InboundMessage::Reconnected { attempts: 1 },
            welcome("conn-2"),
        ]
    );
}

#[tokio::test]
async fn test_disabled_reconnect_ends_inbound_stream() {
    let url = spawn_restarting_server().await;
    let (_client, mut inbound) = SignalingClient::connect_with(&url, ReconnectPolicy::disabled())
        .await
        .unwrap();

    assert_eq!(inbound.recv().await, Some(welcome("conn-1")));
    assert_eq!(inbound.recv().await, Some(InboundMessage::ConnectionLost));
    assert_eq!(inbound.recv().await, None);
}

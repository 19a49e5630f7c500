//! Reconnect behavior against a real local WebSocket endpoint: the full
//! subscription set is re-asserted before the client declares ready.

use futures_util::StreamExt;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use pumpwatch::ingest::{FeedConfig, FeedEvent, PumpFeedClient};

async fn next_text(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
) -> Option<String> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => return Some(text),
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
    None
}

#[tokio::test]
async fn subscriptions_survive_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://{}", addr);

    let (frames_tx, frames_rx) = tokio::sync::oneshot::channel();
    let server = tokio::spawn(async move {
        // Connection 1: complete the handshake, read the initial
        // subscription, then sever.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let first_frame = next_text(&mut ws).await.unwrap();
        drop(ws);

        // Connection 2: refuse the handshake outright.
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        // Connection 3: accept, record what the client re-asserts, then hold
        // the connection open until the client hangs up.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let reasserted_a = next_text(&mut ws).await.unwrap();
        let reasserted_b = next_text(&mut ws).await.unwrap();
        let _ = frames_tx.send((first_frame, reasserted_a, reasserted_b));
        while let Some(frame) = ws.next().await {
            if frame.is_err() {
                break;
            }
        }
    });

    let config = FeedConfig {
        url,
        reconnect_delay_ms: 50,
        max_reconnect_attempts: 10,
        heartbeat_ms: 30_000,
        connect_timeout_ms: 5_000,
    };
    let (handle, client, mut events) = PumpFeedClient::new(config);
    handle.subscribe(vec!["A".to_string(), "B".to_string(), "C".to_string()]);
    let client_task = tokio::spawn(client.run());

    // Wait for the client to come back ready on the third connection.
    let mut ready_count = 0;
    let deadline = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = events.recv().await {
            if matches!(event, FeedEvent::Ready) {
                ready_count += 1;
                if ready_count == 2 {
                    break;
                }
            }
        }
    });
    deadline.await.expect("client never became ready twice");

    // Still on the live third connection at this point.
    assert!(handle.is_connected());
    assert_eq!(handle.subscribed_mints().len(), 3);

    let (first_frame, reasserted_a, reasserted_b) =
        tokio::time::timeout(Duration::from_secs(10), frames_rx)
            .await
            .unwrap()
            .unwrap();

    // Every connection starts with the new-token subscription.
    assert!(first_frame.contains("subscribeNewToken"));
    assert!(reasserted_a.contains("subscribeNewToken"));

    // The full tracked-mint set rides the very next frame, exactly once,
    // before any command traffic.
    let frame: serde_json::Value = serde_json::from_str(&reasserted_b).unwrap();
    assert_eq!(frame["method"], "subscribeTokenTrade");
    let mut keys: Vec<String> = frame["keys"]
        .as_array()
        .unwrap()
        .iter()
        .map(|k| k.as_str().unwrap().to_string())
        .collect();
    keys.sort();
    assert_eq!(keys, vec!["A", "B", "C"]);

    handle.disconnect();
    let _ = tokio::time::timeout(Duration::from_secs(5), client_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), server).await;
}

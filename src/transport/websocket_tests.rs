use crate::broker::Broker;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::websocket::serve;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type Ws = WebSocketStream<TcpStream>;

async fn setup_server_and_client() -> (Ws, Arc<Broker>) {
    let broker = Arc::new(Broker::default());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(serve(listener, broker.clone()));

    let stream = TcpStream::connect(addr).await.expect("Failed to connect");
    let (ws_stream, _) = tokio_tungstenite::client_async("ws://localhost/", stream)
        .await
        .expect("WebSocket handshake failed");
    (ws_stream, broker)
}

async fn send(ws: &mut Ws, msg: &ClientMessage) {
    ws.send(WsMessage::Text(serde_json::to_string(msg).unwrap().into()))
        .await
        .expect("Failed to send message");
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    let response = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("Did not receive response")
        .unwrap();
    let raw_data = response.into_data();
    serde_json::from_slice(&raw_data).unwrap_or_else(|e| {
        panic!(
            "Failed to deserialize ServerMessage from '{:?}': {}",
            raw_data, e
        );
    })
}

fn declare_queue(name: &str) -> ClientMessage {
    ClientMessage::DeclareQueue {
        queue: name.to_string(),
        durable: false,
        exclusive: false,
        auto_delete: false,
        dead_letter_exchange: None,
        dead_letter_routing_key: None,
        max_length: None,
        max_redeliveries: None,
    }
}

#[tokio::test]
async fn test_publish_consume_ack_over_websocket() {
    let (mut ws, broker) = setup_server_and_client().await;

    send(&mut ws, &declare_queue("hello")).await;
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::QueueDeclared {
            queue: "hello".to_string()
        }
    );

    send(
        &mut ws,
        &ClientMessage::Publish {
            exchange: String::new(),
            routing_key: "hello".to_string(),
            payload: "Hello World!".to_string(),
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Published { matched, .. } => assert_eq!(matched, 1),
        other => panic!("Expected Published, got {:?}", other),
    }

    send(
        &mut ws,
        &ClientMessage::Consume {
            queue: "hello".to_string(),
            prefetch: Some(1),
            auto_ack: false,
        },
    )
    .await;
    let consumer = match recv(&mut ws).await {
        ServerMessage::ConsumeOk { consumer, .. } => consumer,
        other => panic!("Expected ConsumeOk, got {:?}", other),
    };
    let delivery_tag = match recv(&mut ws).await {
        ServerMessage::Delivery {
            payload,
            delivery_tag,
            ..
        } => {
            assert_eq!(payload, "Hello World!");
            delivery_tag
        }
        other => panic!("Expected Delivery, got {:?}", other),
    };

    send(
        &mut ws,
        &ClientMessage::Ack {
            consumer,
            delivery_tag,
        },
    )
    .await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Acked { .. }));

    let stats = broker.queue_stats("hello").unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.unacked, 0);
}

#[tokio::test]
async fn test_disconnect_requeues_unacked() {
    let (mut ws, broker) = setup_server_and_client().await;

    send(&mut ws, &declare_queue("tasks")).await;
    recv(&mut ws).await;
    broker.publish("", "tasks", "task-1").unwrap();

    send(
        &mut ws,
        &ClientMessage::Consume {
            queue: "tasks".to_string(),
            prefetch: Some(1),
            auto_ack: false,
        },
    )
    .await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::ConsumeOk { .. }));
    assert!(matches!(recv(&mut ws).await, ServerMessage::Delivery { .. }));
    assert_eq!(broker.queue_stats("tasks").unwrap().unacked, 1);

    ws.close(None).await.expect("Failed to close WebSocket");

    // cleanup runs on the server task
    let mut stats = broker.queue_stats("tasks").unwrap();
    for _ in 0..50 {
        if stats.consumers == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        stats = broker.queue_stats("tasks").unwrap();
    }
    assert_eq!(stats.consumers, 0);
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.unacked, 0);
}

#[tokio::test]
async fn test_invalid_frame_gets_error_reply() {
    let (mut ws, _) = setup_server_and_client().await;

    ws.send(WsMessage::Text("{\"type\":\"subscribe\"}".to_string().into()))
        .await
        .expect("Failed to send");
    match recv(&mut ws).await {
        ServerMessage::Error { message } => assert!(message.starts_with("invalid message")),
        other => panic!("Expected Error, got {:?}", other),
    }

    // the connection stays usable
    send(&mut ws, &declare_queue("")).await;
    match recv(&mut ws).await {
        ServerMessage::QueueDeclared { queue } => assert!(queue.starts_with("amq.gen-")),
        other => panic!("Expected QueueDeclared, got {:?}", other),
    }
}

use crate::broker::{Broker, DeliveryState, ExchangeKind};
use crate::client::Client;
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::transport::session::Session;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

fn session() -> (Session, mpsc::UnboundedReceiver<WsMessage>, Arc<Broker>) {
    let broker = Arc::new(Broker::default());
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(broker.clone(), Client::new(tx));
    (session, rx, broker)
}

async fn next_frame(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> ServerMessage {
    let msg = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no frame within 1s")
        .expect("channel closed");
    if let WsMessage::Text(text) = msg {
        serde_json::from_str(&text).unwrap()
    } else {
        panic!("Expected a text message");
    }
}

#[test]
fn test_client_message_wire_format() {
    let msg: ClientMessage = serde_json::from_value(json!({
        "type": "declare_queue",
        "queue": "tasks",
        "durable": true,
        "dead_letter_exchange": "dlx"
    }))
    .unwrap();
    assert_eq!(
        msg,
        ClientMessage::DeclareQueue {
            queue: "tasks".to_string(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: Some("dlx".to_string()),
            dead_letter_routing_key: None,
            max_length: None,
            max_redeliveries: None,
        }
    );

    let msg: ClientMessage = serde_json::from_value(json!({
        "type": "publish",
        "routing_key": "hello",
        "payload": "hi"
    }))
    .unwrap();
    assert_eq!(
        msg,
        ClientMessage::Publish {
            exchange: String::new(),
            routing_key: "hello".to_string(),
            payload: "hi".to_string(),
        }
    );
}

#[tokio::test]
async fn test_handle_declare_and_publish() {
    let (mut session, mut rx, broker) = session();

    session.handle_text(
        &json!({"type": "declare_exchange", "exchange": "logs", "kind": "fanout"}).to_string(),
    );
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::ExchangeDeclared {
            exchange: "logs".to_string(),
            kind: ExchangeKind::Fanout
        }
    );

    session.handle_text(&json!({"type": "declare_queue", "queue": "a"}).to_string());
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::QueueDeclared {
            queue: "a".to_string()
        }
    );

    session.handle_text(
        &json!({"type": "bind", "queue": "a", "exchange": "logs"}).to_string(),
    );
    assert!(matches!(next_frame(&mut rx).await, ServerMessage::Bound { .. }));

    session.handle_text(
        &json!({"type": "publish", "exchange": "logs", "routing_key": "", "payload": "x"})
            .to_string(),
    );
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::Published {
            exchange: "logs".to_string(),
            routing_key: String::new(),
            matched: 1,
            enqueued: 1,
        }
    );
    assert_eq!(broker.queue_stats("a").unwrap().pending, 1);
}

#[tokio::test]
async fn test_handle_invalid_message() {
    let (mut session, mut rx, _) = session();

    session.handle_text("not json");
    assert!(matches!(next_frame(&mut rx).await, ServerMessage::Error { .. }));

    session.handle_text(&json!({"type": "bind", "queue": "q", "exchange": "missing"}).to_string());
    match next_frame(&mut rx).await {
        ServerMessage::Error { message } => assert_eq!(message, "queue `q` not found"),
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_consume_streams_deliveries() {
    let (mut session, mut rx, broker) = session();
    broker
        .declare_queue(crate::broker::QueueDefinition::new("jobs"))
        .unwrap();
    broker.publish("", "jobs", "job-1").unwrap();

    session.handle(ClientMessage::Consume {
        queue: "jobs".to_string(),
        prefetch: Some(1),
        auto_ack: false,
    });
    let consumer = match next_frame(&mut rx).await {
        ServerMessage::ConsumeOk {
            consumer,
            queue,
            prefetch,
            auto_ack,
        } => {
            assert_eq!(queue, "jobs");
            assert_eq!(prefetch, 1);
            assert!(!auto_ack);
            consumer
        }
        other => panic!("Expected ConsumeOk, got {other:?}"),
    };

    let tag = match next_frame(&mut rx).await {
        ServerMessage::Delivery {
            consumer: c,
            payload,
            delivery_tag,
            redelivered,
            ..
        } => {
            assert_eq!(c, consumer);
            assert_eq!(payload, "job-1");
            assert!(!redelivered);
            delivery_tag
        }
        other => panic!("Expected Delivery, got {other:?}"),
    };

    session.handle(ClientMessage::Ack {
        consumer: consumer.clone(),
        delivery_tag: tag,
    });
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::Acked {
            consumer: consumer.clone(),
            delivery_tag: tag
        }
    );

    // prefetch budget is free again
    broker.publish("", "jobs", "job-2").unwrap();
    assert!(matches!(
        next_frame(&mut rx).await,
        ServerMessage::Delivery { .. }
    ));
}

#[tokio::test]
async fn test_nack_reports_outcome() {
    let (mut session, mut rx, broker) = session();
    broker
        .declare_queue(crate::broker::QueueDefinition::new("jobs"))
        .unwrap();
    broker.publish("", "jobs", "bad").unwrap();

    session.handle(ClientMessage::Consume {
        queue: "jobs".to_string(),
        prefetch: None,
        auto_ack: false,
    });
    let ServerMessage::ConsumeOk { consumer, .. } = next_frame(&mut rx).await else {
        panic!("Expected ConsumeOk");
    };
    let ServerMessage::Delivery { delivery_tag, .. } = next_frame(&mut rx).await else {
        panic!("Expected Delivery");
    };

    session.handle(ClientMessage::Nack {
        consumer: consumer.clone(),
        delivery_tag,
        requeue: false,
    });
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::Nacked {
            consumer,
            delivery_tag,
            outcome: DeliveryState::Discarded
        }
    );
}

#[tokio::test]
async fn test_foreign_consumer_is_rejected() {
    let (mut session, mut rx, broker) = session();
    broker
        .declare_queue(crate::broker::QueueDefinition::new("jobs"))
        .unwrap();
    let foreign = broker.register_consumer("jobs", 1).unwrap();

    session.handle(ClientMessage::Ack {
        consumer: foreign.clone(),
        delivery_tag: 1,
    });
    assert!(matches!(next_frame(&mut rx).await, ServerMessage::Error { .. }));

    session.handle(ClientMessage::Cancel { consumer: foreign });
    assert!(matches!(next_frame(&mut rx).await, ServerMessage::Error { .. }));
    assert_eq!(broker.queue_stats("jobs").unwrap().consumers, 1);
}

#[tokio::test]
async fn test_cancel_and_close_requeue_unacked() {
    let (mut session, mut rx, broker) = session();
    broker
        .declare_queue(crate::broker::QueueDefinition::new("jobs"))
        .unwrap();
    broker.publish("", "jobs", "one").unwrap();
    broker.publish("", "jobs", "two").unwrap();

    session.handle(ClientMessage::Consume {
        queue: "jobs".to_string(),
        prefetch: Some(1),
        auto_ack: false,
    });
    let ServerMessage::ConsumeOk { consumer, .. } = next_frame(&mut rx).await else {
        panic!("Expected ConsumeOk");
    };
    assert!(matches!(
        next_frame(&mut rx).await,
        ServerMessage::Delivery { .. }
    ));

    session.handle(ClientMessage::Cancel {
        consumer: consumer.clone(),
    });
    assert_eq!(
        next_frame(&mut rx).await,
        ServerMessage::Cancelled {
            consumer,
            requeued: 1
        }
    );
    assert_eq!(session.consumer_count(), 0);
    assert_eq!(broker.queue_stats("jobs").unwrap().pending, 2);

    session.handle(ClientMessage::Consume {
        queue: "jobs".to_string(),
        prefetch: Some(1),
        auto_ack: false,
    });
    assert!(matches!(
        next_frame(&mut rx).await,
        ServerMessage::ConsumeOk { .. }
    ));
    assert!(matches!(
        next_frame(&mut rx).await,
        ServerMessage::Delivery { .. }
    ));

    assert_eq!(session.close(), 1);
    let stats = broker.queue_stats("jobs").unwrap();
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.consumers, 0);
}

#[tokio::test]
async fn test_auto_ack_consume_needs_no_ack() {
    let (mut session, mut rx, broker) = session();
    broker
        .declare_queue(crate::broker::QueueDefinition::new("feed"))
        .unwrap();
    for n in 0..3 {
        broker.publish("", "feed", format!("tick-{n}")).unwrap();
    }

    session.handle_text(
        &json!({"type": "consume", "queue": "feed", "prefetch": 1, "auto_ack": true}).to_string(),
    );
    assert!(matches!(
        next_frame(&mut rx).await,
        ServerMessage::ConsumeOk { auto_ack: true, .. }
    ));

    // all three arrive although prefetch is 1 and nothing is acked
    for n in 0..3 {
        match next_frame(&mut rx).await {
            ServerMessage::Delivery { payload, state, .. } => {
                assert_eq!(payload, format!("tick-{n}"));
                assert_eq!(state, DeliveryState::Acked);
            }
            other => panic!("Expected Delivery, got {other:?}"),
        }
    }
    let stats = broker.queue_stats("feed").unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.unacked, 0);
}

#[tokio::test]
async fn test_close_deletes_exclusive_queues() {
    let (mut session, mut rx, broker) = session();
    broker
        .declare_exchange(&crate::broker::ExchangeDefinition::new("logs").fanout())
        .unwrap();

    session.handle_text(&json!({"type": "declare_queue", "queue": "", "exclusive": true}).to_string());
    let ServerMessage::QueueDeclared { queue } = next_frame(&mut rx).await else {
        panic!("Expected QueueDeclared");
    };
    session.handle_text(&json!({"type": "bind", "queue": queue, "exchange": "logs"}).to_string());
    assert!(matches!(next_frame(&mut rx).await, ServerMessage::Bound { .. }));

    session.close();
    for _ in 0..1000 {
        assert_eq!(broker.publish("logs", "", "line").unwrap().matched, 0);
    }
    assert!(broker.queue_stats(&queue).is_err());
}

#[tokio::test]
async fn test_cancel_removes_auto_delete_queue() {
    let (mut session, mut rx, broker) = session();

    session.handle_text(&json!({"type": "declare_queue", "auto_delete": true}).to_string());
    let ServerMessage::QueueDeclared { queue } = next_frame(&mut rx).await else {
        panic!("Expected QueueDeclared");
    };
    session.handle_text(&json!({"type": "consume", "queue": queue}).to_string());
    let ServerMessage::ConsumeOk { consumer, .. } = next_frame(&mut rx).await else {
        panic!("Expected ConsumeOk");
    };
    assert!(broker.queue_stats(&queue).is_ok());

    session.handle(ClientMessage::Cancel { consumer });
    assert!(matches!(
        next_frame(&mut rx).await,
        ServerMessage::Cancelled { requeued: 0, .. }
    ));
    assert!(broker.queue_stats(&queue).is_err());
}

#[tokio::test]
async fn test_binary_payload_is_delivered_as_bytes() {
    let (mut session, mut rx, broker) = session();
    broker
        .declare_queue(crate::broker::QueueDefinition::new("raw"))
        .unwrap();
    broker.publish("", "raw", vec![0xff_u8, 0x00, 0xfe]).unwrap();
    broker.publish("", "raw", "text").unwrap();

    session.handle(ClientMessage::Consume {
        queue: "raw".to_string(),
        prefetch: None,
        auto_ack: true,
    });
    assert!(matches!(
        next_frame(&mut rx).await,
        ServerMessage::ConsumeOk { .. }
    ));

    match next_frame(&mut rx).await {
        ServerMessage::Delivery {
            payload,
            payload_bytes,
            ..
        } => {
            assert!(payload.is_empty());
            assert_eq!(payload_bytes, Some(vec![0xff, 0x00, 0xfe]));
        }
        other => panic!("Expected Delivery, got {other:?}"),
    }
    match next_frame(&mut rx).await {
        ServerMessage::Delivery {
            payload,
            payload_bytes,
            ..
        } => {
            assert_eq!(payload, "text");
            assert_eq!(payload_bytes, None);
        }
        other => panic!("Expected Delivery, got {other:?}"),
    }
}

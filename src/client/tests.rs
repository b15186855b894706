use super::connection::{Client, ConsumerHandle};
use crate::transport::message::ServerMessage;
use tokio::sync::{mpsc, oneshot};
use tungstenite::protocol::Message as WsMessage;

#[test]
fn test_client_new() {
    let (tx, _) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    assert!(client.id.starts_with("client-"));
    assert_eq!(client.consumer_count(), 0);
}

#[test]
fn test_client_send_serializes_frame() {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);

    assert!(client.send(&ServerMessage::QueueDeclared {
        queue: "tasks".to_string()
    }));

    let received = rx.try_recv().unwrap();
    if let WsMessage::Text(text) = received {
        let frame: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(
            frame,
            ServerMessage::QueueDeclared {
                queue: "tasks".to_string()
            }
        );
        assert!(text.contains(r#""type":"queue_declared""#));
    } else {
        panic!("Expected a text message");
    }
}

#[test]
fn test_outbox_reports_closed_connection() {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(tx);
    let outbox = client.outbox();

    drop(rx);
    assert!(outbox.is_closed());
    assert!(!outbox.send(&ServerMessage::error("gone")));
}

#[tokio::test]
async fn test_client_tracks_consumers() {
    let (tx, _rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);

    let (stop, _stopped) = oneshot::channel();
    let task = tokio::spawn(async {});
    client.track_consumer(
        "ctag-1".to_string(),
        ConsumerHandle {
            queue: "q".to_string(),
            stop,
            task,
        },
    );

    assert!(client.owns_consumer("ctag-1"));
    assert!(!client.owns_consumer("ctag-2"));

    let handle = client.take_consumer("ctag-1").expect("tracked consumer");
    assert_eq!(handle.queue, "q");
    assert!(client.take_consumer("ctag-1").is_none());
    assert!(client.drain_consumers().is_empty());
}

#[test]
fn test_client_tracks_owned_queues() {
    let (tx, _rx) = mpsc::unbounded_channel::<WsMessage>();
    let mut client = Client::new(tx);

    client.own_queue("amq.gen-a");
    client.own_queue("amq.gen-a");
    client.own_queue("amq.gen-b");
    assert_eq!(client.owned_queues().count(), 2);

    let mut drained = client.drain_queues();
    drained.sort();
    assert_eq!(drained, vec!["amq.gen-a".to_string(), "amq.gen-b".to_string()]);
    assert_eq!(client.owned_queues().count(), 0);
}

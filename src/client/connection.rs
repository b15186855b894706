use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;
use tungstenite::protocol::Message as WsMessage;
use uuid::Uuid;

use crate::broker::ConsumerId;
use crate::transport::message::ServerMessage;

/// Cloneable sending half of a client's websocket connection.
///
/// Consumer tasks hold their own `Outbox` so they can push deliveries without
/// going through the `Client`.
#[derive(Debug, Clone)]
pub struct Outbox {
    client_id: String,
    sender: UnboundedSender<WsMessage>,
}

impl Outbox {
    /// Serialize `frame` and queue it for the socket. Returns `false` once the
    /// connection's send loop is gone.
    pub fn send(&self, frame: &ServerMessage) -> bool {
        let json = match serde_json::to_string(frame) {
            Ok(json) => json,
            Err(e) => {
                warn!(client = %self.client_id, "failed to serialize frame: {e}");
                return false;
            }
        };
        self.sender.send(WsMessage::Text(json.into())).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// A consumer started by this client: its queue, the signal that stops its
/// delivery loop and the loop itself.
#[derive(Debug)]
pub struct ConsumerHandle {
    pub queue: String,
    pub stop: oneshot::Sender<()>,
    pub task: JoinHandle<()>,
}

/// Represents a connected websocket client.
///
/// Each client is uniquely identified by an `id`, owns the channel to its
/// socket and tracks the consumers it registered and the exclusive queues it
/// declared, so both can be cleaned up when the connection goes away.
#[derive(Debug)]
pub struct Client {
    /// Unique identifier for the client (`client-<uuid>`).
    pub id: String,

    /// Channel to send websocket messages to the client.
    pub sender: UnboundedSender<WsMessage>,

    consumers: HashMap<ConsumerId, ConsumerHandle>,
    queues: HashSet<String>,
}

impl Client {
    pub fn new(sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("client-{}", Uuid::new_v4()),
            sender,
            consumers: HashMap::new(),
            queues: HashSet::new(),
        }
    }

    pub fn outbox(&self) -> Outbox {
        Outbox {
            client_id: self.id.clone(),
            sender: self.sender.clone(),
        }
    }

    pub fn send(&self, frame: &ServerMessage) -> bool {
        self.outbox().send(frame)
    }

    pub fn track_consumer(&mut self, consumer: ConsumerId, handle: ConsumerHandle) {
        self.consumers.insert(consumer, handle);
    }

    pub fn owns_consumer(&self, consumer: &str) -> bool {
        self.consumers.contains_key(consumer)
    }

    pub fn take_consumer(&mut self, consumer: &str) -> Option<ConsumerHandle> {
        self.consumers.remove(consumer)
    }

    /// Remove and return every tracked consumer.
    pub fn drain_consumers(&mut self) -> Vec<(ConsumerId, ConsumerHandle)> {
        self.consumers.drain().collect()
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Record a queue that lives only as long as this connection.
    pub fn own_queue(&mut self, queue: &str) {
        self.queues.insert(queue.to_owned());
    }

    pub fn owned_queues(&self) -> impl Iterator<Item = &str> {
        self.queues.iter().map(String::as_str)
    }

    pub fn drain_queues(&mut self) -> Vec<String> {
        self.queues.drain().collect()
    }
}

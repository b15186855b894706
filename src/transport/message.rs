use serde::{Deserialize, Serialize};

use crate::broker::{DeliveryState, DeliveryTag, ExchangeKind, Message};
use crate::utils::error::BrokerError;

/// Commands a websocket client can send, one JSON object per text frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    DeclareExchange {
        exchange: String,
        kind: ExchangeKind,
        #[serde(default)]
        durable: bool,
    },

    /// An empty `queue` asks the broker for a generated name.
    DeclareQueue {
        #[serde(default)]
        queue: String,
        #[serde(default)]
        durable: bool,
        #[serde(default)]
        exclusive: bool,
        #[serde(default)]
        auto_delete: bool,
        dead_letter_exchange: Option<String>,
        dead_letter_routing_key: Option<String>,
        max_length: Option<usize>,
        max_redeliveries: Option<u32>,
    },

    Bind {
        queue: String,
        exchange: String,
        #[serde(default)]
        pattern: String,
    },

    Unbind {
        queue: String,
        exchange: String,
        #[serde(default)]
        pattern: String,
    },

    Publish {
        #[serde(default)]
        exchange: String,
        routing_key: String,
        payload: String,
    },

    /// Start streaming deliveries from `queue`. Without `prefetch` the
    /// broker's default applies. `auto_ack` deliveries need no `ack`.
    Consume {
        queue: String,
        prefetch: Option<u16>,
        #[serde(default)]
        auto_ack: bool,
    },

    Cancel {
        consumer: String,
    },

    Ack {
        consumer: String,
        delivery_tag: DeliveryTag,
    },

    Nack {
        consumer: String,
        delivery_tag: DeliveryTag,
        #[serde(default)]
        requeue: bool,
    },
}

/// Frames the server sends back. Every command gets exactly one reply;
/// `Delivery` frames arrive asynchronously for each active consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ExchangeDeclared {
        exchange: String,
        kind: ExchangeKind,
    },
    QueueDeclared {
        queue: String,
    },
    Bound {
        queue: String,
        exchange: String,
        pattern: String,
    },
    Unbound {
        queue: String,
        exchange: String,
        pattern: String,
        existed: bool,
    },
    Published {
        exchange: String,
        routing_key: String,
        matched: usize,
        enqueued: usize,
    },
    ConsumeOk {
        consumer: String,
        queue: String,
        prefetch: u16,
        auto_ack: bool,
    },
    Cancelled {
        consumer: String,
        requeued: usize,
    },
    Acked {
        consumer: String,
        delivery_tag: DeliveryTag,
    },
    Nacked {
        consumer: String,
        delivery_tag: DeliveryTag,
        outcome: DeliveryState,
    },
    Delivery {
        consumer: String,
        queue: String,
        message_id: String,
        exchange: String,
        routing_key: String,
        delivery_tag: DeliveryTag,
        redelivered: bool,
        redelivery_count: u32,
        timestamp: i64,
        /// `delivered` until acked, or `acked` for an auto-ack consumer.
        state: DeliveryState,
        /// The payload when it is UTF-8 text, empty otherwise.
        payload: String,
        /// The raw payload when it is not UTF-8.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload_bytes: Option<Vec<u8>>,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn delivery(consumer: &str, queue: &str, message: &Message, state: DeliveryState) -> Self {
        let (payload, payload_bytes) = match message.payload_str() {
            Some(text) => (text.to_owned(), None),
            None => (String::new(), Some(message.payload.to_vec())),
        };
        ServerMessage::Delivery {
            consumer: consumer.to_owned(),
            queue: queue.to_owned(),
            message_id: message.message_id.clone(),
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            delivery_tag: message.delivery_tag,
            redelivered: message.redelivered(),
            redelivery_count: message.redelivery_count,
            timestamp: message.published_at,
            state,
            payload,
            payload_bytes,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

impl From<BrokerError> for ServerMessage {
    fn from(err: BrokerError) -> Self {
        ServerMessage::error(err.to_string())
    }
}

//! Message definitions for the broker
//!
//! A `Message` is one copy of a published payload sitting in one queue. Fan-out
//! to N queues produces N independent copies; each acquires its own delivery
//! tag from its own queue.
//!
//! Notes on fields:
//! - `payload`: opaque bytes, never inspected by the broker
//! - `published_at`: milliseconds since UNIX epoch, set at publish time
//! - `enqueued_at`: milliseconds since UNIX epoch, set when the copy entered
//!   its current queue; kept across requeues
//! - `delivery_tag`: `0` while pending; assigned at handoff to a consumer and
//!   unique within the owning queue
//! - `redelivery_count`: number of times the message went back to `pending`
//!   after having been delivered
//! - `death`: present once the message has been dead-lettered

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type DeliveryTag = u64;

/// Why a message left its original queue for a dead-letter exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeathReason {
    /// The consumer nacked with `requeue = false`.
    Rejected,
    /// A requeue would have exceeded the queue's redelivery limit.
    DeliveryLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathRecord {
    pub queue: String,
    pub reason: DeathReason,
    /// Exchange and routing key the message carried before dead-lettering.
    pub exchange: String,
    pub routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_id: String,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
    pub published_at: i64,
    pub enqueued_at: i64,
    pub delivery_tag: DeliveryTag,
    pub redelivery_count: u32,
    pub death: Option<DeathRecord>,
}

impl Message {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            message_id: Uuid::new_v4().to_string(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            published_at: now,
            enqueued_at: now,
            delivery_tag: 0,
            redelivery_count: 0,
            death: None,
        }
    }

    /// True if this delivery is not the first one of the message.
    pub fn redelivered(&self) -> bool {
        self.redelivery_count > 0
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

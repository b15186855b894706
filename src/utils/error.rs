//! The `error` module defines the error type shared by every broker operation.
//!
//! Routing and queue-state failures are returned synchronously to the caller of
//! the operation that produced them. None of them are fatal to the broker: an
//! `UnknownTag` on ack, for example, leaves every other in-flight delivery
//! untouched.

use std::fmt;

use thiserror::Error;

use crate::broker::message::DeliveryTag;

/// The kind of named entity an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Exchange,
    Queue,
    Consumer,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Exchange => "exchange",
            Entity::Queue => "queue",
            Entity::Consumer => "consumer",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Redeclaration with parameters that differ from the live entity.
    #[error("{entity} `{name}` conflicts with existing declaration: {reason}")]
    Conflict {
        entity: Entity,
        name: String,
        reason: String,
    },

    /// Operation on an exchange, queue or consumer that does not exist.
    #[error("{entity} `{name}` not found")]
    NotFound { entity: Entity, name: String },

    /// Ack/nack of a tag that was already settled, never issued, or issued to
    /// another consumer.
    #[error("unknown delivery tag {tag}")]
    UnknownTag { tag: DeliveryTag },

    /// The injected upstream transport could not be reached.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("queue `{0}` is closed")]
    QueueClosed(String),

    #[error("queue `{queue}` is full ({limit} messages)")]
    QueueFull { queue: String, limit: usize },
}

impl BrokerError {
    pub fn not_found(entity: Entity, name: impl Into<String>) -> Self {
        BrokerError::NotFound {
            entity,
            name: name.into(),
        }
    }

    pub fn conflict(entity: Entity, name: impl Into<String>, reason: impl Into<String>) -> Self {
        BrokerError::Conflict {
            entity,
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

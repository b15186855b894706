//! The routing and delivery core.
//!
//! Leaf-first:
//! - `exchange`: exchange kinds, bindings and topic matching
//! - `routing`: the table of exchanges; resolves (exchange, key) to queues
//! - `message`: one message copy and its delivery metadata
//! - `queue`: pending/unacked buffers with prefetch accounting
//! - `delivery`: per-consumer pull, ack and nack handling
//! - `dead_letter`: republishing of rejected messages
//! - `engine`: the `Broker` composition root

pub mod dead_letter;
pub mod delivery;
pub mod engine;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod routing;

pub use delivery::{ConsumerOptions, DeliveryState, NackOutcome};
pub use engine::{Broker, PublishReport};
pub use exchange::{DEFAULT_EXCHANGE, ExchangeDefinition, ExchangeKind};
pub use message::{DeathReason, DeliveryTag, Message};
pub use queue::{ConsumerId, QueueDefinition, QueueStats};

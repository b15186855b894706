//! # RelayMQ
//!
//! `relaymq` is an in-process message-routing core: exchanges route published
//! messages to queues, consumers pull from queues within a prefetch budget and
//! settle every delivery with an ack or a nack, and rejected messages can be
//! dead-lettered into another exchange. A small websocket server exposes the
//! same operations as JSON commands.
//!
//! ## Core Modules
//!
//! - `broker`: exchanges, queues, delivery tracking, dead-lettering and the
//!   `Broker` that composes them.
//! - `client`: Represents a connected websocket client.
//! - `config`: Handles loading and managing server configuration.
//! - `transport`: The upstream delivery capability, the websocket protocol and
//!   server.
//! - `utils`: Shared error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::Broker;
pub use utils::error::{BrokerError, Result};

//! The `client` module defines the representation of a connected websocket
//! client.
//!
//! A `Client` holds its unique identifier, the channel that feeds its socket
//! and the consumers it started. `Outbox` is the cloneable sending half handed
//! to consumer delivery loops.

pub mod connection;
pub use connection::{Client, ConsumerHandle, Outbox};

#[cfg(test)]
mod tests;

//! The `transport` module connects the broker to the outside world.
//!
//! `upstream` is the capability the broker pulls raw deliveries from.
//! `message` defines the JSON protocol spoken over websockets, `session`
//! maps that protocol onto broker calls for one connection, and `websocket`
//! runs the server that accepts connections.

pub mod message;
pub mod session;
pub mod upstream;
pub mod websocket;

#[cfg(test)]
mod tests;

#[cfg(test)]
mod websocket_tests;

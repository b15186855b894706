//! Upstream transport capability
//!
//! The broker does not own a network transport. Whatever feeds raw
//! `(routing_key, payload)` pairs into it from outside is injected at
//! construction as an `Upstream`. Reconnect and backoff belong to the
//! implementation; the broker only surfaces `TransportUnavailable` to its
//! caller.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use crate::utils::error::{BrokerError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub routing_key: String,
    pub payload: Bytes,
}

impl RawDelivery {
    pub fn new(routing_key: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            payload: payload.into(),
        }
    }
}

pub trait Upstream: Send + Sync {
    /// Drain whatever is currently available for `queue`. Must not block.
    fn deliver(&self, queue: &str) -> Result<Vec<RawDelivery>>;
}

/// An upstream that never has anything to deliver.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUpstream;

impl Upstream for NullUpstream {
    fn deliver(&self, _queue: &str) -> Result<Vec<RawDelivery>> {
        Ok(Vec::new())
    }
}

/// In-process upstream fed through one unbounded channel per queue.
///
/// Once every sender of a feed is dropped and the buffered deliveries have
/// been drained, the feed reports `TransportUnavailable`.
#[derive(Debug, Default)]
pub struct ChannelUpstream {
    feeds: Mutex<HashMap<String, mpsc::UnboundedReceiver<RawDelivery>>>,
}

impl ChannelUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the feed for `queue` and return its sending side.
    pub fn feed(&self, queue: &str) -> mpsc::UnboundedSender<RawDelivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue.to_owned(), rx);
        tx
    }
}

impl Upstream for ChannelUpstream {
    fn deliver(&self, queue: &str) -> Result<Vec<RawDelivery>> {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(rx) = feeds.get_mut(queue) else {
            return Ok(Vec::new());
        };

        let mut batch = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(delivery) => batch.push(delivery),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if batch.is_empty() {
                        feeds.remove(queue);
                        return Err(BrokerError::TransportUnavailable(format!(
                            "feed for `{queue}` disconnected"
                        )));
                    }
                    break;
                }
            }
        }
        Ok(batch)
    }
}

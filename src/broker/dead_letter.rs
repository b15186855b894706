//! Dead-letter routing
//!
//! Republishes messages a queue has given up on into the queue's configured
//! dead-letter exchange. This is fire-and-forget: when the target exchange is
//! missing or nothing is bound to it, the message is dropped, a warning is
//! logged and the drop counter goes up. Nothing is ever raised to the consumer
//! that nacked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::broker::message::{DeathReason, DeathRecord, Message};
use crate::broker::queue::{DeadLetterConfig, QueueRegistry};
use crate::broker::routing::RoutingTable;

/// Result of one dead-letter republish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeadLetterReport {
    /// Queues the dead-letter exchange routed to.
    pub matched: usize,
    /// Queues that accepted the copy.
    pub enqueued: usize,
}

impl DeadLetterReport {
    pub fn dropped(&self) -> bool {
        self.enqueued == 0
    }
}

#[derive(Debug)]
pub struct DeadLetterRouter {
    routing: Arc<RoutingTable>,
    queues: Arc<QueueRegistry>,
    drops: AtomicU64,
}

impl DeadLetterRouter {
    pub fn new(routing: Arc<RoutingTable>, queues: Arc<QueueRegistry>) -> Self {
        Self {
            routing,
            queues,
            drops: AtomicU64::new(0),
        }
    }

    /// Number of dead-lettered messages that reached no queue.
    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Republish `message`, which died in `source_queue`, to `target`.
    ///
    /// The copy starts a fresh delivery history in the dead-letter queue and
    /// records where and why it died.
    pub fn route(
        &self,
        message: Message,
        source_queue: &str,
        target: &DeadLetterConfig,
        reason: DeathReason,
    ) -> DeadLetterReport {
        let routing_key = target
            .routing_key
            .clone()
            .unwrap_or_else(|| message.routing_key.clone());

        let dead = Message {
            exchange: target.exchange.clone(),
            routing_key: routing_key.clone(),
            delivery_tag: 0,
            redelivery_count: 0,
            death: Some(DeathRecord {
                queue: source_queue.to_owned(),
                reason,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
            }),
            ..message
        };

        let matches = match self.routing.route(&target.exchange, &routing_key) {
            Ok(matches) => matches,
            Err(e) => {
                warn!(
                    queue = source_queue,
                    exchange = %target.exchange,
                    routing_key = %routing_key,
                    error = %e,
                    "dead-letter exchange unavailable, message dropped"
                );
                self.drops.fetch_add(1, Ordering::Relaxed);
                return DeadLetterReport::default();
            }
        };

        let mut report = DeadLetterReport {
            matched: matches.len(),
            enqueued: 0,
        };

        for name in &matches {
            let Some(queue) = self.queues.get(name) else {
                continue;
            };
            match queue.enqueue(dead.clone()) {
                Ok(()) => report.enqueued += 1,
                Err(e) => warn!(
                    queue = source_queue,
                    target_queue = %name,
                    error = %e,
                    "dead-letter copy rejected by target queue"
                ),
            }
        }

        if report.dropped() {
            warn!(
                queue = source_queue,
                exchange = %target.exchange,
                routing_key = %routing_key,
                "no queue bound for dead-lettered message, message dropped"
            );
            self.drops.fetch_add(1, Ordering::Relaxed);
        } else {
            debug!(
                queue = source_queue,
                exchange = %target.exchange,
                routing_key = %routing_key,
                enqueued = report.enqueued,
                ?reason,
                "message dead-lettered"
            );
        }

        report
    }
}

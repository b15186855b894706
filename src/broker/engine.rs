//! Broker engine
//!
//! The composition root. It owns the routing table, the queues, the
//! dead-letter router and the live consumer registrations, and wires them
//! together without holding routing or delivery logic of its own.
//!
//! Concurrency and usage notes:
//! - Every method takes `&self`; share the broker as `Arc<Broker>`. There is no
//!   broker-wide lock: routing uses a read-mostly lock, each queue serializes
//!   its own state, and consumer lookups only clone an `Arc` out of the map.
//! - `pull` is the only suspending operation. It waits on the queue's wake-up
//!   handle, so an idle consumer costs nothing and cannot starve others.
//! - Publishing to an exchange that routes to no queue is not an error. The
//!   message is dropped and the report says `matched == 0`, which is how the
//!   broker behaves for unbound exchanges in general.
//! - A publish that matches several queues enqueues into each independently.
//!   One queue refusing the copy (full, deleted) does not undo the others; the
//!   refusal is listed in `PublishReport::failures`.
//! - An auto-delete queue goes away with the cancellation of its last
//!   consumer, bindings included.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::dead_letter::DeadLetterRouter;
use crate::broker::delivery::{ConsumerOptions, DeliveryState, DeliveryTracker, NackOutcome};
use crate::broker::exchange::{DEFAULT_EXCHANGE, ExchangeDefinition, ExchangeKind};
use crate::broker::message::{DeliveryTag, Message};
use crate::broker::queue::{ConsumerId, Queue, QueueDefinition, QueueRegistry, QueueStats};
use crate::broker::routing::RoutingTable;
use crate::config::BrokerSettings;
use crate::transport::upstream::{NullUpstream, Upstream};
use crate::utils::error::{BrokerError, Entity, Result};

/// Per-queue result of a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Queues the exchange routed to.
    pub matched: usize,
    /// Queues that accepted their copy.
    pub enqueued: usize,
    /// Queues that refused their copy, with the reason.
    pub failures: Vec<(String, BrokerError)>,
}

impl PublishReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Broker {
    routing: Arc<RoutingTable>,
    queues: Arc<QueueRegistry>,
    dead_letters: Arc<DeadLetterRouter>,
    consumers: RwLock<HashMap<ConsumerId, Arc<DeliveryTracker>>>,
    settings: BrokerSettings,
    upstream: Arc<dyn Upstream>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.queues.len())
            .field("settings", &self.settings)
            .field("upstream", &"dyn Upstream")
            .finish()
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerSettings::default(), Arc::new(NullUpstream))
    }
}

impl Broker {
    pub fn new(settings: BrokerSettings, upstream: Arc<dyn Upstream>) -> Self {
        let routing = Arc::new(RoutingTable::new());
        let queues = Arc::new(QueueRegistry::new());
        let dead_letters = Arc::new(DeadLetterRouter::new(routing.clone(), queues.clone()));
        Self {
            routing,
            queues,
            dead_letters,
            consumers: RwLock::new(HashMap::new()),
            settings,
            upstream,
        }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<()> {
        self.routing.declare_exchange(def)
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.routing.exchange_kind(name)
    }

    /// Declare a queue and return its name, generated when `def` has none.
    ///
    /// Limits the definition leaves unset are filled from the broker settings
    /// before the idempotency check, so repeating the same declaration is
    /// always a no-op. A new queue is bound to the default exchange under its
    /// own name.
    pub fn declare_queue(&self, mut def: QueueDefinition) -> Result<String> {
        if def.name.is_empty() {
            def.name = format!("amq.gen-{}", Uuid::new_v4().simple());
        }
        if def.max_length.is_none() {
            def.max_length = self.settings.queue_length_limit();
        }
        if def.max_redeliveries.is_none() {
            def.max_redeliveries = self.settings.redelivery_limit();
        }

        let (queue, created) = self.queues.declare(def)?;
        let name = queue.name().to_owned();
        if created {
            self.routing.bind(&name, DEFAULT_EXCHANGE, &name)?;
            info!(
                queue = %name,
                durable = queue.is_durable(),
                exclusive = queue.is_exclusive(),
                auto_delete = queue.is_auto_delete(),
                "queue declared"
            );
        }
        Ok(name)
    }

    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.queues.require(queue)?;
        self.routing.bind(queue, exchange, pattern)?;
        Ok(())
    }

    /// Returns whether the binding existed.
    pub fn unbind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<bool> {
        self.queues.require(queue)?;
        self.routing.unbind(queue, exchange, pattern)
    }

    /// Route a payload through `exchange` and enqueue a copy into every
    /// matching queue.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> Result<PublishReport> {
        let matches = self.routing.route(exchange, routing_key)?;
        let message = Message::new(exchange, routing_key, payload);

        let mut report = PublishReport {
            matched: matches.len(),
            ..Default::default()
        };
        if matches.is_empty() {
            debug!(exchange, routing_key, "no queue matched, message dropped");
            return Ok(report);
        }

        for name in matches {
            let result = self
                .queues
                .require(&name)
                .and_then(|queue| queue.enqueue(message.clone()));
            match result {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    warn!(exchange, routing_key, queue = %name, error = %e, "queue refused published message");
                    report.failures.push((name, e));
                }
            }
        }

        debug!(
            exchange,
            routing_key,
            matched = report.matched,
            enqueued = report.enqueued,
            "message published"
        );
        Ok(report)
    }

    /// Register a manual-ack consumer on `queue` and return its id.
    /// `prefetch == 0` means unlimited.
    pub fn register_consumer(&self, queue: &str, prefetch: u16) -> Result<ConsumerId> {
        self.register_consumer_with(queue, ConsumerOptions::prefetch(prefetch))
    }

    pub fn register_consumer_with(
        &self,
        queue: &str,
        options: ConsumerOptions,
    ) -> Result<ConsumerId> {
        let queue = self.queues.require(queue)?;
        let consumer = format!("ctag-{}", Uuid::new_v4());
        let limit = queue.max_redeliveries();
        let tracker = DeliveryTracker::register(
            queue,
            consumer.clone(),
            options,
            limit,
            self.dead_letters.clone(),
        )?;
        self.track(Arc::new(tracker))?;
        Ok(consumer)
    }

    /// Make a registered tracker reachable by id.
    ///
    /// A queue deleted between the registration and this insert has already
    /// swept the consumer map, so the tracker is taken back out here.
    pub(crate) fn track(&self, tracker: Arc<DeliveryTracker>) -> Result<()> {
        let consumer = tracker.consumer_id().to_owned();
        self.consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(consumer.clone(), tracker.clone());

        if tracker.queue().is_closed() {
            self.consumers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&consumer);
            tracker.close();
            return Err(BrokerError::QueueClosed(tracker.queue_name().to_owned()));
        }
        Ok(())
    }

    /// The delivery tracker behind a consumer id.
    pub fn tracker(&self, consumer: &str) -> Result<Arc<DeliveryTracker>> {
        self.consumers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(consumer)
            .cloned()
            .ok_or_else(|| BrokerError::not_found(Entity::Consumer, consumer))
    }

    /// Non-blocking pull.
    pub fn try_pull(&self, consumer: &str) -> Result<Option<Message>> {
        self.tracker(consumer)?.try_next()
    }

    /// Suspend until a message is available for `consumer`.
    pub async fn pull(&self, consumer: &str) -> Result<Message> {
        let tracker = self.tracker(consumer)?;
        tracker.pull().await
    }

    /// Suspend until a message is available or `cancel` resolves (`None`).
    pub async fn pull_until<F>(&self, consumer: &str, cancel: F) -> Result<Option<Message>>
    where
        F: Future<Output = ()>,
    {
        let tracker = self.tracker(consumer)?;
        tracker.pull_until(cancel).await
    }

    pub fn ack(&self, consumer: &str, tag: DeliveryTag) -> Result<()> {
        self.tracker(consumer)?.ack(tag)
    }

    pub fn nack(&self, consumer: &str, tag: DeliveryTag, requeue: bool) -> Result<NackOutcome> {
        self.tracker(consumer)?.nack(tag, requeue)
    }

    /// Drop a consumer registration. Its unacked messages go back to the
    /// queue; returns how many. Cancelling the last consumer of an
    /// auto-delete queue deletes the queue.
    pub fn cancel_consumer(&self, consumer: &str) -> Result<usize> {
        let tracker = self
            .consumers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(consumer)
            .ok_or_else(|| BrokerError::not_found(Entity::Consumer, consumer))?;
        let requeued = tracker.close();

        let queue = tracker.queue();
        if let Some(dropped) = queue.close_if_unused() {
            if self.queues.remove_instance(queue) {
                self.unlink_queue(queue);
            }
            info!(queue = %queue.name(), dropped, "auto-delete queue removed");
        }
        Ok(requeued)
    }

    /// Take the head of `queue` without acknowledgement (auto-ack get).
    pub fn get(&self, queue: &str) -> Result<Option<Message>> {
        self.queues.require(queue)?.pop()
    }

    /// Drop every pending message of `queue`; returns how many.
    pub fn purge_queue(&self, queue: &str) -> Result<usize> {
        let purged = self.queues.require(queue)?.purge();
        debug!(queue, purged, "queue purged");
        Ok(purged)
    }

    /// Delete `queue` with its bindings and consumers. Returns the number of
    /// pending and unacked messages dropped with it.
    pub fn delete_queue(&self, queue: &str) -> Result<usize> {
        let removed = self
            .queues
            .remove(queue)
            .ok_or_else(|| BrokerError::not_found(Entity::Queue, queue))?;
        let dropped = removed.close();
        let consumers = self.unlink_queue(&removed);

        info!(queue, dropped, consumers, "queue deleted");
        Ok(dropped)
    }

    /// Drop the bindings and consumers of a queue that has been closed and
    /// taken out of the registry. Returns how many consumers were closed.
    fn unlink_queue(&self, queue: &Arc<Queue>) -> usize {
        self.routing.remove_queue(queue.name());

        let closed: Vec<Arc<DeliveryTracker>> = {
            let mut consumers = self.consumers.write().unwrap_or_else(PoisonError::into_inner);
            let ids: Vec<ConsumerId> = consumers
                .iter()
                .filter(|(_, tracker)| Arc::ptr_eq(tracker.queue(), queue))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| consumers.remove(id)).collect()
        };
        for tracker in &closed {
            tracker.close();
        }
        closed.len()
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats> {
        Ok(self.queues.require(queue)?.stats())
    }

    /// `Pending` or `Delivered` while the copy is in `queue`; `None` once it
    /// has been acked, discarded or dead-lettered.
    pub fn message_state(&self, queue: &str, message_id: &str) -> Result<Option<DeliveryState>> {
        Ok(self.queues.require(queue)?.message_state(message_id))
    }

    /// Move whatever the upstream has for `queue` into it.
    ///
    /// Upstream failures propagate as `TransportUnavailable`. Deliveries the
    /// queue refuses are listed in the report.
    pub fn pump_upstream(&self, queue: &str) -> Result<PublishReport> {
        let target = self.queues.require(queue)?;
        let deliveries = self.upstream.deliver(queue)?;

        let mut report = PublishReport {
            matched: deliveries.len(),
            ..Default::default()
        };
        for raw in deliveries {
            let message = Message::new(DEFAULT_EXCHANGE, raw.routing_key, raw.payload);
            match target.enqueue(message) {
                Ok(()) => report.enqueued += 1,
                Err(e) => {
                    warn!(queue, error = %e, "queue refused upstream delivery");
                    report.failures.push((queue.to_owned(), e));
                }
            }
        }
        Ok(report)
    }

    /// Dead-lettered messages that reached no queue so far.
    pub fn dead_letter_drops(&self) -> u64 {
        self.dead_letters.drops()
    }
}

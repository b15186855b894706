//! Delivery tracking
//!
//! One `DeliveryTracker` exists per (queue, consumer) registration. It is the
//! consumer's handle on the queue: it pulls within the prefetch budget,
//! suspends while nothing can be delivered, and settles deliveries.
//!
//! Per message copy the states are:
//!
//! ```text
//! Pending -> Delivered -> Acked
//!                      -> Requeued -> Pending
//!                      -> DeadLettered
//!                      -> Discarded
//! ```
//!
//! Only `Delivered` counts against prefetch. A requeued message may be handed
//! to any consumer of the queue next, including this one. An auto-ack
//! consumer's deliveries go straight from `Pending` to `Acked`.
//!
//! Requeueing is unbounded unless a redelivery limit is configured; past the
//! limit a requeue is treated as a reject and the message is dead-lettered
//! (or discarded when the queue has no dead-letter target).

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::broker::dead_letter::{DeadLetterReport, DeadLetterRouter};
use crate::broker::message::{DeathReason, DeliveryTag, Message};
use crate::broker::queue::{ConsumerId, Queue, Settlement};
use crate::utils::error::{BrokerError, Entity, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Delivered,
    Acked,
    Requeued,
    DeadLettered,
    Discarded,
}

/// How a consumer takes deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub prefetch: u16,
    pub auto_ack: bool,
}

impl ConsumerOptions {
    /// Manual acknowledgement with at most `prefetch` unacked deliveries
    /// (`0` = unlimited).
    pub fn prefetch(prefetch: u16) -> Self {
        Self {
            prefetch,
            auto_ack: false,
        }
    }

    /// Deliveries are acknowledged at handoff.
    pub fn auto_ack(mut self) -> Self {
        self.auto_ack = true;
        self
    }
}

/// What a nack did to the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { redelivery_count: u32 },
    DeadLettered {
        reason: DeathReason,
        report: DeadLetterReport,
    },
    Discarded { reason: DeathReason },
}

impl NackOutcome {
    pub fn state(&self) -> DeliveryState {
        match self {
            NackOutcome::Requeued { .. } => DeliveryState::Requeued,
            NackOutcome::DeadLettered { .. } => DeliveryState::DeadLettered,
            NackOutcome::Discarded { .. } => DeliveryState::Discarded,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
    pub discarded: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    acked: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug)]
pub struct DeliveryTracker {
    consumer: ConsumerId,
    queue: Arc<Queue>,
    options: ConsumerOptions,
    redelivery_limit: Option<u32>,
    dead_letters: Arc<DeadLetterRouter>,
    closed: AtomicBool,
    counters: Counters,
}

impl DeliveryTracker {
    pub fn register(
        queue: Arc<Queue>,
        consumer: ConsumerId,
        options: ConsumerOptions,
        redelivery_limit: Option<u32>,
        dead_letters: Arc<DeadLetterRouter>,
    ) -> Result<Self> {
        queue.add_consumer(&consumer, options.prefetch, options.auto_ack)?;
        debug!(
            queue = %queue.name(),
            consumer = %consumer,
            prefetch = options.prefetch,
            auto_ack = options.auto_ack,
            "consumer registered"
        );
        Ok(Self {
            consumer,
            queue,
            options,
            redelivery_limit,
            dead_letters,
            closed: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    pub fn prefetch(&self) -> u16 {
        self.options.prefetch
    }

    pub fn is_auto_ack(&self) -> bool {
        self.options.auto_ack
    }

    /// State a message handed out by this tracker is in.
    pub fn delivered_state(&self) -> DeliveryState {
        if self.options.auto_ack {
            DeliveryState::Acked
        } else {
            DeliveryState::Delivered
        }
    }

    pub fn redelivery_limit(&self) -> Option<u32> {
        self.redelivery_limit
    }

    /// Deliveries currently held by this consumer.
    pub fn in_flight(&self) -> usize {
        self.queue.in_flight(&self.consumer)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// A deleted queue reports `QueueClosed` even after its consumers were
    /// closed along with it.
    fn ensure_open(&self) -> Result<()> {
        if self.queue.is_closed() {
            return Err(BrokerError::QueueClosed(self.queue.name().to_owned()));
        }
        if self.is_closed() {
            return Err(BrokerError::not_found(Entity::Consumer, &self.consumer));
        }
        Ok(())
    }

    /// Take the next message if one is pending and the prefetch budget allows.
    /// Never blocks.
    pub fn try_next(&self) -> Result<Option<Message>> {
        self.ensure_open()?;
        let next = self.queue.next_for(&self.consumer)?;
        if let Some(message) = &next {
            self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            if self.options.auto_ack {
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
            }
            debug!(
                queue = %self.queue.name(),
                consumer = %self.consumer,
                delivery_tag = message.delivery_tag,
                redelivery_count = message.redelivery_count,
                "message delivered"
            );
        }
        Ok(next)
    }

    /// Wait until a message can be delivered to this consumer.
    ///
    /// Suspends without polling while the queue is empty or the consumer is at
    /// its prefetch limit. Fails once the consumer is closed or the queue is
    /// deleted. Dropping the future before it resolves takes nothing off the
    /// queue.
    pub async fn pull(&self) -> Result<Message> {
        loop {
            let changed = self.queue.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if let Some(message) = self.try_next()? {
                return Ok(message);
            }
            changed.await;
        }
    }

    /// Like `pull`, but gives up with `None` as soon as `cancel` resolves.
    pub async fn pull_until<F>(&self, cancel: F) -> Result<Option<Message>>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => Ok(None),
            message = self.pull() => message.map(Some),
        }
    }

    pub fn ack(&self, tag: DeliveryTag) -> Result<()> {
        self.ensure_open()?;
        match self.queue.ack(&self.consumer, tag) {
            Ok(_) => {
                self.counters.acked.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %self.queue.name(), consumer = %self.consumer, delivery_tag = tag, "message acked");
                Ok(())
            }
            Err(e) => {
                warn!(queue = %self.queue.name(), consumer = %self.consumer, delivery_tag = tag, "ack rejected: {e}");
                Err(e)
            }
        }
    }

    /// Settle a delivery negatively. A dead-letter drop is reported in the
    /// outcome, never as an error.
    pub fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<NackOutcome> {
        self.ensure_open()?;
        let settlement = self
            .queue
            .nack(&self.consumer, tag, requeue, self.redelivery_limit)
            .inspect_err(|e| {
                warn!(queue = %self.queue.name(), consumer = %self.consumer, delivery_tag = tag, "nack rejected: {e}");
            })?;

        let outcome = match settlement {
            Settlement::Requeued { redelivery_count } => {
                self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                debug!(queue = %self.queue.name(), delivery_tag = tag, redelivery_count, "message requeued");
                NackOutcome::Requeued { redelivery_count }
            }
            Settlement::DeadLetter {
                message,
                target,
                reason,
            } => {
                self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                let report = self
                    .dead_letters
                    .route(message, self.queue.name(), &target, reason);
                NackOutcome::DeadLettered { reason, report }
            }
            Settlement::Discarded { message, reason } => {
                self.counters.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    queue = %self.queue.name(),
                    message_id = %message.message_id,
                    ?reason,
                    "message discarded, queue has no dead-letter exchange"
                );
                NackOutcome::Discarded { reason }
            }
        };
        Ok(outcome)
    }

    /// Close the registration. Every message this consumer still holds goes
    /// back to `pending`; returns how many. Closing twice is a no-op.
    pub fn close(&self) -> usize {
        if self.closed.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let requeued = self.queue.remove_consumer(&self.consumer);
        debug!(queue = %self.queue.name(), consumer = %self.consumer, requeued, "consumer closed");
        requeued
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            acked: self.counters.acked.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            discarded: self.counters.discarded.load(Ordering::Relaxed),
        }
    }
}

//! Queues
//!
//! A `Queue` owns an ordered `pending` buffer and the `unacked` deliveries
//! currently held by its consumers. Every message copy lives in exactly one of
//! the two until it is acked, discarded or handed to a dead-letter exchange.
//!
//! All state changes go through one mutex per queue, so prefetch accounting,
//! delivery-tag assignment and the move from `pending` to `unacked` happen in a
//! single critical section. Operations on different queues never contend.
//!
//! `pending` is FIFO for first deliveries. Requeued messages go back to the
//! front, which gives retries a rough in-order bias but is only a policy.
//!
//! The queue never calls into the dead-letter path itself: `nack` returns a
//! `Settlement` and the caller routes it after the lock is released. A queue
//! that dead-letters into itself would otherwise deadlock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::debug;

use crate::broker::delivery::DeliveryState;
use crate::broker::message::{DeathReason, DeliveryTag, Message};
use crate::utils::error::{BrokerError, Entity, Result};

pub type ConsumerId = String;

/// Where a queue sends messages it gives up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterConfig {
    pub exchange: String,
    /// Replaces the message's routing key when set.
    pub routing_key: Option<String>,
}

/// Declaration parameters for a queue.
///
/// Fixed at declaration: a redeclaration must match every field, and the
/// dead-letter target can never change afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) dead_letter: Option<DeadLetterConfig>,
    pub(crate) max_length: Option<usize>,
    pub(crate) max_redeliveries: Option<u32>,
}

impl QueueDefinition {
    /// A transient, shared queue. An empty name asks the broker to generate one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Retained and compared on redeclaration; nothing is persisted.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Only one consumer may be registered at a time.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// The queue is deleted once its last consumer is cancelled. A queue that
    /// never had a consumer stays.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Rejected messages are republished to `exchange`, with `routing_key`
    /// replacing the original key when given.
    pub fn with_dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter = Some(DeadLetterConfig {
            exchange: exchange.to_owned(),
            routing_key: routing_key.map(str::to_owned),
        });
        self
    }

    /// Enqueue fails with `QueueFull` once `max` messages are pending.
    pub fn max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    /// A message may go back to `pending` at most `max` times; the next
    /// requeue is turned into a dead-letter. `0` disables requeueing.
    pub fn max_redeliveries(mut self, max: u32) -> Self {
        self.max_redeliveries = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A delivered message waiting for its consumer's verdict.
#[derive(Debug, Clone)]
pub struct Unacked {
    pub message: Message,
    pub consumer: ConsumerId,
    /// Milliseconds since UNIX epoch when the copy entered this queue.
    pub enqueued_at: i64,
    /// Milliseconds since UNIX epoch at handoff.
    pub delivered_at: i64,
}

/// What a nack did to the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Back at the head of `pending`.
    Requeued { redelivery_count: u32 },
    /// Must be republished to the queue's dead-letter exchange.
    DeadLetter {
        message: Message,
        target: DeadLetterConfig,
        reason: DeathReason,
    },
    /// No dead-letter target; the message is gone.
    Discarded {
        message: Message,
        reason: DeathReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub unacked: usize,
    pub consumers: usize,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy)]
struct ConsumerSlot {
    prefetch: u16,
    in_flight: usize,
    auto_ack: bool,
}

impl ConsumerSlot {
    fn has_budget(&self) -> bool {
        self.auto_ack || self.prefetch == 0 || self.in_flight < usize::from(self.prefetch)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<Message>,
    unacked: HashMap<DeliveryTag, Unacked>,
    consumers: HashMap<ConsumerId, ConsumerSlot>,
    last_tag: DeliveryTag,
    closed: bool,
}

impl QueueState {
    /// Remove `tag` from `unacked` if `consumer` holds it, releasing one unit
    /// of the consumer's prefetch budget.
    fn settle(&mut self, consumer: &str, tag: DeliveryTag) -> Result<Unacked> {
        let owned = self
            .unacked
            .get(&tag)
            .is_some_and(|entry| entry.consumer == consumer);
        if !owned {
            return Err(BrokerError::UnknownTag { tag });
        }
        let entry = self
            .unacked
            .remove(&tag)
            .ok_or(BrokerError::UnknownTag { tag })?;

        if let Some(slot) = self.consumers.get_mut(consumer) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Ok(entry)
    }
}

#[derive(Debug)]
pub struct Queue {
    def: QueueDefinition,
    state: Mutex<QueueState>,
    available: Notify,
}

impl Queue {
    pub fn new(def: QueueDefinition) -> Self {
        Self {
            def,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.def
    }

    pub fn is_durable(&self) -> bool {
        self.def.durable
    }

    pub fn is_exclusive(&self) -> bool {
        self.def.exclusive
    }

    pub fn is_auto_delete(&self) -> bool {
        self.def.auto_delete
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterConfig> {
        self.def.dead_letter.as_ref()
    }

    pub fn max_redeliveries(&self) -> Option<u32> {
        self.def.max_redeliveries
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait handle that resolves on the next state change that could make a
    /// delivery possible (enqueue, settlement, consumer removal, close).
    ///
    /// Callers enable the handle before checking the queue so a change between
    /// the check and the await is not missed.
    pub fn notified(&self) -> Notified<'_> {
        self.available.notified()
    }

    fn wake(&self) {
        self.available.notify_waiters();
    }

    /// Append a message to `pending`. Never blocks.
    pub fn enqueue(&self, mut message: Message) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(BrokerError::QueueClosed(self.def.name.clone()));
            }
            if let Some(limit) = self.def.max_length {
                if state.pending.len() >= limit {
                    return Err(BrokerError::QueueFull {
                        queue: self.def.name.clone(),
                        limit,
                    });
                }
            }
            message.delivery_tag = 0;
            message.enqueued_at = chrono::Utc::now().timestamp_millis();
            state.pending.push_back(message);
        }
        self.wake();
        Ok(())
    }

    /// Register `consumer`. An `auto_ack` consumer's deliveries are settled at
    /// handoff and never count against `prefetch`.
    pub fn add_consumer(&self, consumer: &str, prefetch: u16, auto_ack: bool) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::QueueClosed(self.def.name.clone()));
        }
        if self.def.exclusive && !state.consumers.is_empty() {
            return Err(BrokerError::conflict(
                Entity::Queue,
                &self.def.name,
                "exclusive queue already has a consumer",
            ));
        }
        state.consumers.insert(
            consumer.to_owned(),
            ConsumerSlot {
                prefetch,
                in_flight: 0,
                auto_ack,
            },
        );
        Ok(())
    }

    /// Unregister `consumer` and put every message it still holds back at the
    /// head of `pending`, oldest delivery first. Returns how many were requeued.
    pub fn remove_consumer(&self, consumer: &str) -> usize {
        let requeued = {
            let mut state = self.lock();
            state.consumers.remove(consumer);

            let mut tags: Vec<DeliveryTag> = state
                .unacked
                .iter()
                .filter(|(_, entry)| entry.consumer == consumer)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));

            for tag in &tags {
                if let Some(entry) = state.unacked.remove(tag) {
                    let mut message = entry.message;
                    message.delivery_tag = 0;
                    message.redelivery_count += 1;
                    state.pending.push_front(message);
                }
            }
            tags.len()
        };

        if requeued > 0 {
            debug!(queue = %self.def.name, consumer, requeued, "requeued unacked messages of removed consumer");
        }
        self.wake();
        requeued
    }

    /// Hand the head of `pending` to `consumer` if it has prefetch budget left.
    ///
    /// Returns `None` without blocking when nothing is pending or the consumer
    /// is at its limit.
    pub fn next_for(&self, consumer: &str) -> Result<Option<Message>> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::QueueClosed(self.def.name.clone()));
        }

        let QueueState {
            pending,
            unacked,
            consumers,
            last_tag,
            ..
        } = &mut *state;

        let slot = consumers
            .get_mut(consumer)
            .ok_or_else(|| BrokerError::not_found(Entity::Consumer, consumer))?;
        if !slot.has_budget() {
            return Ok(None);
        }
        let Some(mut message) = pending.pop_front() else {
            return Ok(None);
        };

        *last_tag += 1;
        message.delivery_tag = *last_tag;
        if slot.auto_ack {
            return Ok(Some(message));
        }

        slot.in_flight += 1;
        unacked.insert(
            *last_tag,
            Unacked {
                message: message.clone(),
                consumer: consumer.to_owned(),
                enqueued_at: message.enqueued_at,
                delivered_at: chrono::Utc::now().timestamp_millis(),
            },
        );

        Ok(Some(message))
    }

    /// Permanently remove a delivery. An unknown tag leaves all state as is.
    pub fn ack(&self, consumer: &str, tag: DeliveryTag) -> Result<Message> {
        let entry = self.lock().settle(consumer, tag)?;
        self.wake();
        Ok(entry.message)
    }

    /// Negative-acknowledge a delivery.
    ///
    /// With `requeue` the message returns to the head of `pending` with its
    /// redelivery count bumped, unless that would go past `redelivery_limit`.
    /// Otherwise it is returned for dead-lettering or discarded.
    pub fn nack(
        &self,
        consumer: &str,
        tag: DeliveryTag,
        requeue: bool,
        redelivery_limit: Option<u32>,
    ) -> Result<Settlement> {
        let settlement = {
            let mut state = self.lock();
            let mut message = state.settle(consumer, tag)?.message;
            message.delivery_tag = 0;

            let exhausted = redelivery_limit.is_some_and(|max| message.redelivery_count >= max);
            if requeue && !exhausted {
                message.redelivery_count += 1;
                let redelivery_count = message.redelivery_count;
                state.pending.push_front(message);
                Settlement::Requeued { redelivery_count }
            } else {
                let reason = if requeue {
                    DeathReason::DeliveryLimit
                } else {
                    DeathReason::Rejected
                };
                match &self.def.dead_letter {
                    Some(target) => Settlement::DeadLetter {
                        message,
                        target: target.clone(),
                        reason,
                    },
                    None => Settlement::Discarded { message, reason },
                }
            }
        };
        self.wake();
        Ok(settlement)
    }

    /// Pop the head of `pending` with no acknowledgement bookkeeping.
    pub fn pop(&self) -> Result<Option<Message>> {
        let mut state = self.lock();
        if state.closed {
            return Err(BrokerError::QueueClosed(self.def.name.clone()));
        }
        Ok(state.pending.pop_front())
    }

    /// Drop every pending message. Unacked deliveries are untouched.
    pub fn purge(&self) -> usize {
        let mut state = self.lock();
        let removed = state.pending.len();
        state.pending.clear();
        removed
    }

    /// Close the queue for good, dropping pending and unacked messages and all
    /// consumers. Waiting pulls wake up and observe `QueueClosed`.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            state.closed = true;
            state.consumers.clear();
            let dropped = state.pending.len() + state.unacked.len();
            state.pending.clear();
            state.unacked.clear();
            dropped
        };
        self.wake();
        dropped
    }

    /// Close an auto-delete queue that has no consumer left. Returns the
    /// number of messages dropped, or `None` when the queue stays.
    ///
    /// The check and the close share one critical section, so a consumer
    /// registering concurrently either keeps the queue alive or sees
    /// `QueueClosed`.
    pub fn close_if_unused(&self) -> Option<usize> {
        let dropped = {
            let mut state = self.lock();
            if !self.def.auto_delete || state.closed || !state.consumers.is_empty() {
                return None;
            }
            state.closed = true;
            let dropped = state.pending.len() + state.unacked.len();
            state.pending.clear();
            state.unacked.clear();
            dropped
        };
        self.wake();
        Some(dropped)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Where the copy with `message_id` currently sits in this queue.
    pub fn message_state(&self, message_id: &str) -> Option<DeliveryState> {
        let state = self.lock();
        if state.pending.iter().any(|m| m.message_id == message_id) {
            return Some(DeliveryState::Pending);
        }
        state
            .unacked
            .values()
            .any(|entry| entry.message.message_id == message_id)
            .then_some(DeliveryState::Delivered)
    }

    pub fn in_flight(&self, consumer: &str) -> usize {
        self.lock()
            .consumers
            .get(consumer)
            .map_or(0, |slot| slot.in_flight)
    }

    /// Snapshot of unacked deliveries ordered by delivery tag.
    pub fn unacked(&self) -> Vec<Unacked> {
        let state = self.lock();
        let mut entries: Vec<Unacked> = state.unacked.values().cloned().collect();
        entries.sort_by_key(|entry| entry.message.delivery_tag);
        entries
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            pending: state.pending.len(),
            unacked: state.unacked.len(),
            consumers: state.consumers.len(),
            durable: self.def.durable,
            exclusive: self.def.exclusive,
            auto_delete: self.def.auto_delete,
        }
    }
}

/// Name to queue lookup shared by the broker and the dead-letter router.
#[derive(Debug, Default)]
pub struct QueueRegistry {
    queues: RwLock<HashMap<String, Arc<Queue>>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue, or return the live one if `def` matches it exactly.
    /// The flag is `true` when the queue was created by this call.
    pub fn declare(&self, def: QueueDefinition) -> Result<(Arc<Queue>, bool)> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = queues.get(&def.name) {
            if existing.definition() == &def {
                return Ok((existing.clone(), false));
            }
            return Err(BrokerError::conflict(
                Entity::Queue,
                &def.name,
                "redeclared with different parameters",
            ));
        }

        let queue = Arc::new(Queue::new(def));
        queues.insert(queue.name().to_owned(), queue.clone());
        Ok((queue, true))
    }

    pub fn get(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Like `get`, but an absent queue is `NotFound`.
    pub fn require(&self, name: &str) -> Result<Arc<Queue>> {
        self.get(name)
            .ok_or_else(|| BrokerError::not_found(Entity::Queue, name))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Remove `queue` only if the name still maps to that same instance.
    pub fn remove_instance(&self, queue: &Arc<Queue>) -> bool {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        match queues.get(queue.name()) {
            Some(current) if Arc::ptr_eq(current, queue) => {
                queues.remove(queue.name());
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

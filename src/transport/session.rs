//! Per-connection command handling.
//!
//! A `Session` turns `ClientMessage` commands into broker calls and replies
//! with exactly one `ServerMessage` per command. `consume` starts a delivery
//! loop task that pulls from the broker and pushes `Delivery` frames until the
//! consumer is cancelled or the connection closes. Closing the session cancels
//! every consumer it started, which puts their unacked messages back on their
//! queues, and deletes the exclusive queues it declared.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::broker::delivery::DeliveryTracker;
use crate::broker::{Broker, ConsumerId, ConsumerOptions, ExchangeDefinition, QueueDefinition};
use crate::client::{Client, ConsumerHandle, Outbox};
use crate::transport::message::{ClientMessage, ServerMessage};
use crate::utils::error::{BrokerError, Entity, Result};

pub struct Session {
    broker: Arc<Broker>,
    client: Client,
}

impl Session {
    pub fn new(broker: Arc<Broker>, client: Client) -> Self {
        Self { broker, client }
    }

    pub fn client_id(&self) -> &str {
        &self.client.id
    }

    pub fn consumer_count(&self) -> usize {
        self.client.consumer_count()
    }

    /// Parse one text frame and handle it. Malformed input gets an `error`
    /// reply and leaves the session usable.
    pub fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(command) => self.handle(command),
            Err(err) => {
                warn!(client = %self.client.id, "invalid client message: {err} | {text}");
                self.client
                    .send(&ServerMessage::error(format!("invalid message: {err}")));
            }
        }
    }

    pub fn handle(&mut self, command: ClientMessage) {
        let reply = match self.dispatch(command) {
            Ok(Some(reply)) => reply,
            // already answered
            Ok(None) => return,
            Err(err) => {
                debug!(client = %self.client.id, error = %err, "command failed");
                ServerMessage::from(err)
            }
        };
        self.client.send(&reply);
    }

    fn dispatch(&mut self, command: ClientMessage) -> Result<Option<ServerMessage>> {
        let reply = match command {
            ClientMessage::DeclareExchange {
                exchange,
                kind,
                durable,
            } => {
                let mut def = ExchangeDefinition::new(&exchange).kind(kind);
                if durable {
                    def = def.durable();
                }
                self.broker.declare_exchange(&def)?;
                ServerMessage::ExchangeDeclared { exchange, kind }
            }

            ClientMessage::DeclareQueue {
                queue,
                durable,
                exclusive,
                auto_delete,
                dead_letter_exchange,
                dead_letter_routing_key,
                max_length,
                max_redeliveries,
            } => {
                let mut def = QueueDefinition::new(&queue);
                if durable {
                    def = def.durable();
                }
                if exclusive {
                    def = def.exclusive();
                }
                if auto_delete {
                    def = def.auto_delete();
                }
                if let Some(exchange) = &dead_letter_exchange {
                    def = def.with_dead_letter(exchange, dead_letter_routing_key.as_deref());
                }
                if let Some(max) = max_length {
                    def = def.max_length(max);
                }
                if let Some(max) = max_redeliveries {
                    def = def.max_redeliveries(max);
                }
                let queue = self.broker.declare_queue(def)?;
                if exclusive {
                    self.client.own_queue(&queue);
                }
                ServerMessage::QueueDeclared { queue }
            }

            ClientMessage::Bind {
                queue,
                exchange,
                pattern,
            } => {
                self.broker.bind(&queue, &exchange, &pattern)?;
                ServerMessage::Bound {
                    queue,
                    exchange,
                    pattern,
                }
            }

            ClientMessage::Unbind {
                queue,
                exchange,
                pattern,
            } => {
                let existed = self.broker.unbind(&queue, &exchange, &pattern)?;
                ServerMessage::Unbound {
                    queue,
                    exchange,
                    pattern,
                    existed,
                }
            }

            ClientMessage::Publish {
                exchange,
                routing_key,
                payload,
            } => {
                let report = self.broker.publish(&exchange, &routing_key, payload)?;
                ServerMessage::Published {
                    exchange,
                    routing_key,
                    matched: report.matched,
                    enqueued: report.enqueued,
                }
            }

            ClientMessage::Consume {
                queue,
                prefetch,
                auto_ack,
            } => {
                let prefetch = prefetch.unwrap_or(self.broker.settings().default_prefetch);
                let mut options = ConsumerOptions::prefetch(prefetch);
                if auto_ack {
                    options = options.auto_ack();
                }
                self.consume(queue, options)?;
                return Ok(None);
            }

            ClientMessage::Cancel { consumer } => {
                let handle = self
                    .client
                    .take_consumer(&consumer)
                    .ok_or_else(|| BrokerError::not_found(Entity::Consumer, &consumer))?;
                let requeued = self.stop_consumer(&consumer, handle);
                ServerMessage::Cancelled { consumer, requeued }
            }

            ClientMessage::Ack {
                consumer,
                delivery_tag,
            } => {
                self.ensure_owned(&consumer)?;
                self.broker.ack(&consumer, delivery_tag)?;
                ServerMessage::Acked {
                    consumer,
                    delivery_tag,
                }
            }

            ClientMessage::Nack {
                consumer,
                delivery_tag,
                requeue,
            } => {
                self.ensure_owned(&consumer)?;
                let outcome = self.broker.nack(&consumer, delivery_tag, requeue)?;
                ServerMessage::Nacked {
                    consumer,
                    delivery_tag,
                    outcome: outcome.state(),
                }
            }
        };
        Ok(Some(reply))
    }

    /// Consumers are private to the connection that started them.
    fn ensure_owned(&self, consumer: &str) -> Result<()> {
        if self.client.owns_consumer(consumer) {
            Ok(())
        } else {
            Err(BrokerError::not_found(Entity::Consumer, consumer))
        }
    }

    /// Register a consumer, reply `consume_ok` and start its delivery loop.
    fn consume(&mut self, queue: String, options: ConsumerOptions) -> Result<()> {
        let consumer = self.broker.register_consumer_with(&queue, options)?;
        let tracker = self.broker.tracker(&consumer)?;

        // the reply has to reach the socket before the first delivery
        let outbox = self.client.outbox();
        outbox.send(&ServerMessage::ConsumeOk {
            consumer: consumer.clone(),
            queue: queue.clone(),
            prefetch: options.prefetch,
            auto_ack: options.auto_ack,
        });

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(deliver_loop(tracker, outbox, stopped));
        self.client
            .track_consumer(consumer.clone(), ConsumerHandle { queue, stop, task });

        info!(
            client = %self.client.id,
            consumer = %consumer,
            prefetch = options.prefetch,
            auto_ack = options.auto_ack,
            "consumer started"
        );
        Ok(())
    }

    fn stop_consumer(&self, consumer: &ConsumerId, handle: ConsumerHandle) -> usize {
        let _ = handle.stop.send(());
        match self.broker.cancel_consumer(consumer) {
            Ok(requeued) => requeued,
            // already gone with its queue
            Err(_) => 0,
        }
    }

    /// Cancel every consumer of this connection, then delete the exclusive
    /// queues it declared. Returns how many unacked messages went back to
    /// their queues.
    pub fn close(&mut self) -> usize {
        let consumers = self.client.drain_consumers();
        let count = consumers.len();
        let requeued = consumers
            .into_iter()
            .map(|(consumer, handle)| self.stop_consumer(&consumer, handle))
            .sum();

        let queues = self.client.drain_queues();
        for queue in &queues {
            // auto-delete may have removed it already
            if let Ok(dropped) = self.broker.delete_queue(queue) {
                debug!(client = %self.client.id, queue = %queue, dropped, "exclusive queue deleted");
            }
        }
        debug!(
            client = %self.client.id,
            consumers = count,
            queues = queues.len(),
            requeued,
            "session closed"
        );
        requeued
    }
}

/// Pull from `tracker` and forward every delivery until stopped, the
/// consumer is closed, or the socket is gone.
async fn deliver_loop(
    tracker: Arc<DeliveryTracker>,
    outbox: Outbox,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        let cancel = async {
            let _ = (&mut stopped).await;
        };
        match tracker.pull_until(cancel).await {
            Ok(Some(message)) => {
                let frame = ServerMessage::delivery(
                    tracker.consumer_id(),
                    tracker.queue_name(),
                    &message,
                    tracker.delivered_state(),
                );
                if !outbox.send(&frame) {
                    // unacked; requeued when the session closes
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!(consumer = %tracker.consumer_id(), error = %err, "delivery loop ended");
                // a cancelled consumer already got its `cancelled` reply
                let cancelled = matches!(err, BrokerError::NotFound { .. });
                if !cancelled && !outbox.is_closed() {
                    outbox.send(&ServerMessage::from(err));
                }
                break;
            }
        }
    }
}

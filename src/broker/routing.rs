//! Routing table
//!
//! Owns every exchange and its bindings and answers "which queues receive a
//! message published to exchange E with key K".
//!
//! Concurrency: the table sits behind an `RwLock`, so any number of `route`
//! calls proceed in parallel and only declarations and (un)bindings take the
//! write side. A binding added while a publish is routing may or may not be
//! seen by that publish; each `route` returns a consistent snapshot of the
//! table at the moment it acquired the read lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::broker::exchange::{DEFAULT_EXCHANGE, Exchange, ExchangeDefinition, ExchangeKind};
use crate::utils::error::{BrokerError, Entity, Result};

#[derive(Debug)]
pub struct RoutingTable {
    exchanges: RwLock<HashMap<String, Exchange>>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RoutingTable {
    /// Creates a table holding only the default exchange.
    pub fn new() -> Self {
        let default = Exchange::new(&ExchangeDefinition::new(DEFAULT_EXCHANGE).direct());
        let mut exchanges = HashMap::new();
        exchanges.insert(DEFAULT_EXCHANGE.to_owned(), default);
        Self {
            exchanges: RwLock::new(exchanges),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Exchange>> {
        self.exchanges.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Exchange>> {
        self.exchanges.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare an exchange. Redeclaring with identical parameters is a no-op;
    /// a different kind or durability is a `Conflict`.
    pub fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<()> {
        let mut exchanges = self.write();

        if let Some(existing) = exchanges.get(&def.name) {
            if existing.is_compatible(def) {
                return Ok(());
            }
            return Err(BrokerError::conflict(
                Entity::Exchange,
                &def.name,
                format!(
                    "declared as {} (durable={}), requested {} (durable={})",
                    existing.kind, existing.durable, def.kind, def.durable
                ),
            ));
        }

        exchanges.insert(def.name.clone(), Exchange::new(def));
        debug!(exchange = %def.name, kind = %def.kind, "exchange declared");
        Ok(())
    }

    pub fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.read().get(name).map(|e| e.kind)
    }

    /// Bind `queue` to `exchange` with `pattern`. Binding the same triple twice
    /// is a no-op. Returns whether a new binding was added.
    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<bool> {
        let mut exchanges = self.write();
        let target = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::not_found(Entity::Exchange, exchange))?;

        let added = target.bind(queue, pattern);
        if added {
            debug!(queue, exchange, pattern, "queue bound");
        }
        Ok(added)
    }

    /// Remove one binding. Returns whether it existed.
    pub fn unbind(&self, queue: &str, exchange: &str, pattern: &str) -> Result<bool> {
        let mut exchanges = self.write();
        let target = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::not_found(Entity::Exchange, exchange))?;
        Ok(target.unbind(queue, pattern))
    }

    /// Drop every binding, on every exchange, that targets `queue`.
    pub fn remove_queue(&self, queue: &str) {
        for exchange in self.write().values_mut() {
            exchange.unbind_queue(queue);
        }
    }

    /// Resolve the queues matching `routing_key` on `exchange`.
    ///
    /// An empty set is a valid answer; an unknown exchange is `NotFound`.
    pub fn route(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>> {
        self.read()
            .get(exchange)
            .map(|e| e.matching_queues(routing_key))
            .ok_or_else(|| BrokerError::not_found(Entity::Exchange, exchange))
    }
}

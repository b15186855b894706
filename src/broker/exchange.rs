//! Exchange management
//!
//! An `Exchange` holds the bindings for one exchange name and answers which
//! bound queues match a routing key. The three kinds share one type and differ
//! only in how a binding pattern is compared against the key:
//!
//! - `Direct`: pattern equals the routing key exactly
//! - `Fanout`: pattern is ignored, every bound queue matches
//! - `Topic`: dot-separated words, `*` matches one word, `#` matches the rest
//!
//! Concurrency note: callers must synchronize access to `Exchange` (the
//! routing table keeps every exchange behind its lock).

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of the exchange every queue is implicitly bound to by its own name.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        };
        f.write_str(name)
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            other => Err(format!("unknown exchange kind `{other}`")),
        }
    }
}

/// Declaration parameters for an exchange.
///
/// Two declarations of the same name are compatible when every field here
/// is equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// A non-durable direct exchange named `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Marks the exchange as surviving a restart. The flag is retained and
    /// compared on redeclaration; this crate never persists anything.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Binding {
    pub queue: String,
    pub pattern: String,
}

#[derive(Debug)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    bindings: HashSet<Binding>,
}

impl Exchange {
    pub fn new(def: &ExchangeDefinition) -> Self {
        Self {
            name: def.name.clone(),
            kind: def.kind,
            durable: def.durable,
            bindings: HashSet::new(),
        }
    }

    /// True if `def` redeclares this exchange with identical parameters.
    pub fn is_compatible(&self, def: &ExchangeDefinition) -> bool {
        self.kind == def.kind && self.durable == def.durable
    }

    /// Add a binding. Returns `false` if the identical binding already existed.
    pub fn bind(&mut self, queue: &str, pattern: &str) -> bool {
        self.bindings.insert(Binding {
            queue: queue.to_owned(),
            pattern: pattern.to_owned(),
        })
    }

    /// Remove a binding. Returns `false` if it was not present.
    pub fn unbind(&mut self, queue: &str, pattern: &str) -> bool {
        self.bindings.remove(&Binding {
            queue: queue.to_owned(),
            pattern: pattern.to_owned(),
        })
    }

    /// Drop every binding that targets `queue`.
    pub fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    pub fn bindings(&self) -> impl Iterator<Item = &Binding> {
        self.bindings.iter()
    }

    /// Queues with at least one binding matching `routing_key`. A queue bound
    /// through several matching patterns appears once.
    pub fn matching_queues(&self, routing_key: &str) -> BTreeSet<String> {
        self.bindings
            .iter()
            .filter(|b| match self.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => b.pattern == routing_key,
                ExchangeKind::Topic => topic_matches(&b.pattern, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect()
    }
}

/// Segment-wise topic match.
///
/// `*` consumes exactly one word. `#` consumes whatever is left, including
/// nothing, and ends the match successfully. Without a `#` the pattern has to
/// consume the whole key.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let mut words = routing_key.split('.');

    for segment in pattern.split('.') {
        match segment {
            "#" => return true,
            "*" => {
                if words.next().is_none() {
                    return false;
                }
            }
            literal => {
                if words.next() != Some(literal) {
                    return false;
                }
            }
        }
    }

    words.next().is_none()
}

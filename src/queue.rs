// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Queues declared through the connector are always durable. A queue may be
//! declared with an empty name, in which case the broker generates one; the
//! generated name is what callers must use afterwards.

use serde::{Deserialize, Serialize};

/// Definition of a queue and the key it is bound with.
///
/// When no binding key is given the queue is bound with its own resolved name,
/// which is what direct and fanout exchanges usually want.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) binding_key: Option<String>,
}

impl QueueDefinition {
    /// Creates a definition for the queue `name`. An empty name asks the broker
    /// to generate one.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            binding_key: None,
        }
    }

    /// Creates a definition for a queue whose name the broker generates.
    pub fn generated() -> QueueDefinition {
        QueueDefinition::default()
    }

    /// Sets the binding key (exact key or topic pattern).
    pub fn binding_key(mut self, key: &str) -> Self {
        self.binding_key = Some(key.to_owned());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The key used to bind the queue once its name has been resolved.
    pub fn resolve_binding_key<'a>(&'a self, resolved_name: &'a str) -> &'a str {
        self.binding_key.as_deref().unwrap_or(resolved_name)
    }
}

/// A declared (exchange, queue, binding key) triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueBinding {
    pub queue_name: String,
    pub exchange_name: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: &str, exchange: &str, routing_key: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        }
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the connector's exchange and registers queues on it.
//! A connector owns a single exchange, so every queue declared through
//! `AmqpTopology` is bound to that exchange, either with an explicit binding
//! key or with its own resolved name.
//!
//! Declarations are not guarded client-side: the broker makes them
//! idempotent and reports conflicting ones.

use crate::{
    broker::AmqpChannel,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDefinition,
    routing::has_wildcards,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology: Send + Sync {
    /// Declares the exchange owned by this topology.
    async fn declare_exchange(&self) -> Result<(), AmqpError>;

    /// Declares a durable queue, binds it to the exchange and returns the
    /// name the broker resolved for it.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError>;

    /// Declares every queue in order and returns the resolved names in the
    /// same order.
    async fn install(&self, defs: &[QueueDefinition]) -> Result<Vec<String>, AmqpError>;
}

/// RabbitMQ implementation of the Topology trait, bound to one exchange.
pub struct AmqpTopology {
    channel: Arc<dyn AmqpChannel>,
    exchange: ExchangeDefinition,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn AmqpChannel>, exchange: &ExchangeDefinition) -> AmqpTopology {
        AmqpTopology {
            channel,
            exchange: exchange.clone(),
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    async fn declare_exchange(&self) -> Result<(), AmqpError> {
        debug!(
            "creating exchange: {} ({})",
            self.exchange.name, self.exchange.kind
        );
        self.channel.exchange_declare(&self.exchange).await
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, AmqpError> {
        debug!("creating queue: {:?}", def.name);

        let name = self.channel.queue_declare(&def.name, true).await?;
        if name.is_empty() {
            error!("broker returned an empty queue name");
            return Err(AmqpError::DeclareQueueError(def.name.clone()));
        }

        let key = def.resolve_binding_key(&name);
        if self.exchange.kind != ExchangeKind::Topic && has_wildcards(key) {
            debug!(
                key,
                kind = %self.exchange.kind,
                "wildcard binding key on a non-topic exchange only matches literally"
            );
        }

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            name, self.exchange.name, key
        );
        self.channel
            .queue_bind(&name, &self.exchange.name, key)
            .await?;

        Ok(name)
    }

    async fn install(&self, defs: &[QueueDefinition]) -> Result<Vec<String>, AmqpError> {
        let mut names = Vec::with_capacity(defs.len());
        for def in defs {
            names.push(self.declare_queue(def).await?);
        }

        debug!("queues were bounded");
        Ok(names)
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstraction
//!
//! The connector talks to the broker through three traits: a `Broker` that
//! opens connections, an `AmqpConnection` that opens channels, and an
//! `AmqpChannel` that declares, publishes and consumes. `channel` implements
//! them on top of lapin; `memory` implements them in-process.
//!
//! Deliveries are handed to handlers as `Delivery` values carrying the raw
//! body, the queue they came from and an acker for manual acknowledgement.

use crate::{errors::AmqpError, exchange::ExchangeDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a consumer on one queue.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// AMQP delivery mode. Every message published by the connector is persistent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    #[default]
    Persistent = 2,
}

impl DeliveryMode {
    pub fn from_amqp(mode: u8) -> DeliveryMode {
        if mode == DeliveryMode::Persistent as u8 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Properties carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, String>,
}

/// Settles a delivery received in manual acknowledgement mode.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered to a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub data: Vec<u8>,
    pub properties: MessageProperties,
    /// The broker already considers auto-ack deliveries settled.
    pub auto_ack: bool,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl Delivery {
    /// Acknowledges the delivery. A no-op for auto-ack deliveries.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.auto_ack {
            debug!(delivery_tag = self.delivery_tag, "delivery already auto-acked");
            return Ok(());
        }
        self.acker.ack().await
    }

    /// Negatively acknowledges the delivery. A no-op for auto-ack deliveries.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.auto_ack {
            debug!(delivery_tag = self.delivery_tag, "delivery already auto-acked");
            return Ok(());
        }
        self.acker.nack(requeue).await
    }

    /// Rejects the delivery. A no-op for auto-ack deliveries.
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.auto_ack {
            debug!(delivery_tag = self.delivery_tag, "delivery already auto-acked");
            return Ok(());
        }
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("data", &String::from_utf8_lossy(&self.data))
            .field("properties", &self.properties)
            .field("auto_ack", &self.auto_ack)
            .finish()
    }
}

/// Opens connections to a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Single connection attempt; retries are handled by the connector.
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Box<dyn AmqpConnection>, AmqpError>;
}

/// One logical session with the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A channel multiplexed over a connection. Not meant for concurrent use from
/// several tasks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue and returns its name, generated by the broker when
    /// `name` is empty.
    async fn queue_declare(&self, name: &str, durable: bool) -> Result<String, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Publishes without waiting for a broker confirm.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Cancels every consumer still active on this channel.
    async fn cancel_consumers(&self) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Sends messages to the connector's exchange. Every message is persistent,
//! carries a fresh UUID v4 message id and the caller's trace context in its
//! headers. Publishing does not wait for a broker confirm: a routing key that
//! matches no binding is dropped by the broker without any error.

use crate::{
    broker::{AmqpChannel, DeliveryMode, MessageProperties},
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Content type for JSON payloads.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Publishes opaque payloads under a routing key.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `data` under `routing_key`.
    ///
    /// # Parameters
    /// * `ctx` - Trace context injected into the message headers
    /// * `routing_key` - Routing key; may be empty
    /// * `data` - Raw payload
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - Success once the channel accepted the
    ///   message, `AmqpError::PublishingError` otherwise
    async fn publish(&self, ctx: &Context, routing_key: &str, data: &[u8])
        -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait, bound to one exchange.
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
    exchange: String,
    content_type: Option<String>,
}

impl RabbitMQPublisher {
    /// Creates a publisher for `exchange`. No content type is set by default.
    ///
    /// # Parameters
    /// * `channel` - Channel the messages are published on
    /// * `exchange` - Target exchange name
    ///
    /// # Returns
    /// * `RabbitMQPublisher` - A publisher with no content type
    pub fn new(channel: Arc<dyn AmqpChannel>, exchange: &str) -> RabbitMQPublisher {
        RabbitMQPublisher {
            channel,
            exchange: exchange.to_owned(),
            content_type: None,
        }
    }

    /// Sets the `content_type` property of every published message, e.g.
    /// `JSON_CONTENT_TYPE`.
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    fn properties(&self, ctx: &Context) -> MessageProperties {
        let mut headers = BTreeMap::new();
        otel::inject_context(ctx, &mut headers);

        MessageProperties {
            content_type: self.content_type.clone(),
            delivery_mode: DeliveryMode::Persistent,
            message_id: Some(Uuid::new_v4().to_string()),
            headers,
        }
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        data: &[u8],
    ) -> Result<(), AmqpError> {
        let props = self.properties(ctx);
        debug!(
            exchange = %self.exchange,
            routing_key,
            message_id = ?props.message_id,
            "publishing message"
        );

        self.channel
            .basic_publish(&self.exchange, routing_key, data, props)
            .await
            .inspect_err(|err| error!(error = err.to_string(), "error publishing message"))
    }
}

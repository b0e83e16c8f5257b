// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker traits on top of lapin: it establishes
//! connections to RabbitMQ, opens channels on them, and translates lapin's
//! declarations, publishes and deliveries into the connector's types.

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, Broker, Delivery, DeliveryAcker, DeliveryMode,
        DeliveryStream, MessageProperties,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};
use tracing::{debug, error};

const REPLY_SUCCESS: u16 = 200;

/// Connects to RabbitMQ through lapin.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBroker;

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(
        &self,
        uri: &str,
        connection_name: &str,
    ) -> Result<Box<dyn AmqpConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(Box::new(LapinConnection { conn }))
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(1))
            }
        }
    }
}

pub struct LapinConnection {
    conn: Connection,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!(channel_id = channel.id(), "channel created");
                Ok(Arc::new(LapinChannel::new(channel)))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        debug!("closing amqp connection...");
        self.conn
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to close the connection");
                AmqpError::CloseConnectionError
            })
    }
}

pub struct LapinChannel {
    channel: Channel,
    consumer_tags: Mutex<HashSet<String>>,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        LapinChannel {
            channel,
            consumer_tags: Mutex::new(HashSet::new()),
        }
    }

    fn tags(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.consumer_tags
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) if is_precondition_failed(&err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "exchange exists with different parameters"
                );
                Err(AmqpError::ExchangeConflictError(def.name.clone()))
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = %def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            Ok(_) => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, name: &str, durable: bool) -> Result<String, AmqpError> {
        match self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name, "failure to declare queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
            Ok(queue) => {
                debug!("queue: {} was created", queue.name());
                Ok(queue.name().to_string())
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                data,
                into_basic_properties(properties),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: auto_ack,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        self.tags().insert(consumer_tag.to_owned());

        let queue = queue.to_owned();
        let stream = consumer.map(move |result| match result {
            Ok(delivery) => Ok(into_delivery(delivery, &queue, auto_ack)),
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                Err(AmqpError::ConsumerError(err.to_string()))
            }
        });

        Ok(stream.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.tags().remove(consumer_tag);

        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "failure to cancel consumer");
                AmqpError::CancelConsumerError
            })
    }

    async fn cancel_consumers(&self) -> Result<(), AmqpError> {
        let tags: Vec<String> = self.tags().drain().collect();

        let mut result = Ok(());
        for tag in tags {
            if let Err(err) = self
                .channel
                .basic_cancel(&tag, BasicCancelOptions::default())
                .await
            {
                error!(error = err.to_string(), consumer_tag = %tag, "failure to cancel consumer");
                result = Err(AmqpError::CancelConsumerError);
            }
        }

        result
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let channel_id = self.channel.id();
        debug!(channel_id, "closing amqp channel...");

        self.channel
            .close(REPLY_SUCCESS, "Normal shutdown")
            .await
            .map_err(|err| {
                error!(error = err.to_string(), channel_id, "failure to close the channel");
                AmqpError::CloseChannelError
            })
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                AmqpError::NackMessageError
            })
    }
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::ProtocolError(amqp_err) => matches!(
            amqp_err.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

fn into_basic_properties(props: MessageProperties) -> BasicProperties {
    let headers: BTreeMap<ShortString, AMQPValue> = props
        .headers
        .into_iter()
        .map(|(key, value)| {
            (
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value)),
            )
        })
        .collect();

    let mut properties = BasicProperties::default()
        .with_delivery_mode(props.delivery_mode as u8)
        .with_headers(FieldTable::from(headers));

    if let Some(content_type) = props.content_type {
        properties = properties.with_content_type(ShortString::from(content_type));
    }

    if let Some(message_id) = props.message_id {
        properties = properties.with_message_id(ShortString::from(message_id));
    }

    properties
}

fn from_basic_properties(props: &BasicProperties) -> MessageProperties {
    let headers = props
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(value) => Some((
                        key.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )),
                    AMQPValue::ShortString(value) => Some((key.to_string(), value.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        content_type: props.content_type().as_ref().map(|ct| ct.to_string()),
        delivery_mode: (*props.delivery_mode())
            .map(DeliveryMode::from_amqp)
            .unwrap_or(DeliveryMode::Transient),
        message_id: props.message_id().as_ref().map(|id| id.to_string()),
        headers,
    }
}

fn into_delivery(delivery: lapin::message::Delivery, queue: &str, auto_ack: bool) -> Delivery {
    Delivery {
        delivery_tag: delivery.delivery_tag,
        queue: queue.to_owned(),
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        properties: from_basic_properties(&delivery.properties),
        data: delivery.data,
        auto_ack,
        acker: Arc::new(LapinAcker {
            acker: delivery.acker,
        }),
    }
}

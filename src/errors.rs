// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Exchange Connector
//!
//! `AmqpError` covers every failure the messaging core can surface: connecting,
//! declaring the exchange and queues, publishing, dispatching to handlers and
//! tearing the session down. Handlers report their own failures through
//! `HandlerError`, which the dispatcher wraps with the queue it was serving.
//!
//! A publish whose routing key matches no binding is not an error: the broker
//! drops it and nothing is reported.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// The broker stayed unreachable for every configured attempt
    #[error("failure to connect after {0} attempt(s)")]
    ConnectionError(u32),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The exchange already exists with incompatible parameters
    #[error("exchange `{0}` already exists with different parameters")]
    ExchangeConflictError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`")]
    BindingExchangeToQueueError(String, String),

    /// Error starting a consumer on a queue
    #[error("failure to declare consumer for queue `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish to exchange `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging or rejecting a message
    #[error("failure to nack message")]
    NackMessageError,

    /// A registered handler failed while processing a delivery
    #[error("handler for queue `{queue}` failed: {reason}")]
    HandlerError { queue: String, reason: String },

    /// The delivery stream failed while consuming
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error cancelling the active consumers of a channel
    #[error("failure to cancel consumers")]
    CancelConsumerError,

    /// Error closing the channel
    #[error("failure to close the channel")]
    CloseChannelError,

    /// Error closing the connection
    #[error("failure to close the connection")]
    CloseConnectionError,
}

/// Failure reported by a `ConsumerHandler`.
///
/// Returning it stops the dispatch loop; handlers that should keep consuming
/// must recover locally and return `Ok`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        HandlerError(reason.into())
    }
}

impl From<AmqpError> for HandlerError {
    fn from(err: AmqpError) -> Self {
        HandlerError(err.to_string())
    }
}

/// Invalid configuration values and failures while setting up logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("environment variable `{name}` has an invalid value `{value}`")]
    InvalidValue { name: &'static str, value: String },

    #[error("unsupported exchange kind `{0}`, expected fanout, direct or topic")]
    UnsupportedExchangeKind(String),

    #[error("failure to open log file `{path}`: {reason}")]
    LogFileError { path: String, reason: String },

    #[error("failure to install the log subscriber: {0}")]
    LoggingError(String),
}

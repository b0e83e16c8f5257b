// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Connector
//!
//! Topic-routed publish/subscribe on top of RabbitMQ. An `ExchangeConnector`
//! owns one exchange; the `ExchangeSession` it opens declares queues, publishes
//! and runs a blocking dispatch loop that hands each delivery to the handler
//! registered for its queue. The `memory` broker runs the same code in-process.

mod consumer;
mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod connector;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod handler;
pub mod log_consumer;
pub mod logging;
pub mod memory;
pub mod publisher;
pub mod queue;
pub mod routing;
pub mod topology;

pub use connector::{ExchangeConnector, ExchangeSession};
pub use errors::{AmqpError, ConfigError, HandlerError};
pub use exchange::{ExchangeDefinition, ExchangeKind};

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Producer Log Consumer
//!
//! Topology and handlers of the log-processing service. Four durable queues
//! are bound to the `producer_log` topic exchange:
//!
//! | queue         | binding key   | label         | level |
//! |---------------|---------------|---------------|-------|
//! | `user.info`   | `user.*`      | `user_info`   | INFO  |
//! | `user.error`  | `user.error`  | `user_error`  | ERROR |
//! | `order.info`  | `order.*`     | `order_info`  | INFO  |
//! | `order.error` | `order.error` | `order_error` | ERROR |
//!
//! Every delivery becomes one `<label>: <body>` line in the log sink, the body
//! decoded as lossy UTF-8. `user.error` events therefore show up twice, once
//! per matching queue.

use crate::{
    broker::Delivery,
    connector::ExchangeSession,
    dispatcher::{Dispatcher, DispatcherDefinition, RabbitMQDispatcher},
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    handler::ConsumerHandler,
    queue::QueueDefinition,
    topology::Topology,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::sync::Arc;
use tracing::{error, info};

pub const PRODUCER_LOG_EXCHANGE: &str = "producer_log";

/// The topic exchange shared by the producer and the log consumer.
pub fn exchange() -> ExchangeDefinition {
    ExchangeDefinition::new(PRODUCER_LOG_EXCHANGE).topic()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Error,
}

/// A log queue, its binding pattern and how its messages are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogQueue {
    pub name: &'static str,
    pub binding_key: &'static str,
    pub label: &'static str,
    pub level: LogLevel,
}

pub const LOG_QUEUES: [LogQueue; 4] = [
    LogQueue {
        name: "user.info",
        binding_key: "user.*",
        label: "user_info",
        level: LogLevel::Info,
    },
    LogQueue {
        name: "user.error",
        binding_key: "user.error",
        label: "user_error",
        level: LogLevel::Error,
    },
    LogQueue {
        name: "order.info",
        binding_key: "order.*",
        label: "order_info",
        level: LogLevel::Info,
    },
    LogQueue {
        name: "order.error",
        binding_key: "order.error",
        label: "order_error",
        level: LogLevel::Error,
    },
];

/// Destination of the consumer's log lines.
pub trait LogSink: Send + Sync {
    fn write(&self, level: LogLevel, line: &str);
}

/// Writes lines through `tracing`, i.e. into the consumer log file once file
/// logging is installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, level: LogLevel, line: &str) {
        match level {
            LogLevel::Info => info!(target: "consumer", "{}", line),
            LogLevel::Error => error!(target: "consumer", "{}", line),
        }
    }
}

/// Writes each delivery of one log queue to the sink.
pub struct LogHandler {
    label: &'static str,
    level: LogLevel,
    sink: Arc<dyn LogSink>,
}

impl LogHandler {
    pub fn new(queue: &LogQueue, sink: Arc<dyn LogSink>) -> Self {
        LogHandler {
            label: queue.label,
            level: queue.level,
            sink,
        }
    }
}

#[async_trait]
impl ConsumerHandler for LogHandler {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        let line = format!("{}: {}", self.label, String::from_utf8_lossy(&delivery.data));
        self.sink.write(self.level, &line);
        Ok(())
    }
}

pub fn queue_definitions() -> Vec<QueueDefinition> {
    LOG_QUEUES
        .iter()
        .map(|q| QueueDefinition::new(q.name).binding_key(q.binding_key))
        .collect()
}

/// Declares and binds the log queues, returning their resolved names in
/// `LOG_QUEUES` order.
pub async fn install(session: &ExchangeSession) -> Result<Vec<String>, AmqpError> {
    session.registrar().install(&queue_definitions()).await
}

/// Registers one `LogHandler` per resolved queue name, in `LOG_QUEUES` order.
pub fn register(
    dispatcher: RabbitMQDispatcher,
    names: &[String],
    sink: Arc<dyn LogSink>,
) -> RabbitMQDispatcher {
    LOG_QUEUES
        .iter()
        .zip(names)
        .fold(dispatcher, |dispatcher, (queue, name)| {
            dispatcher.register(
                &DispatcherDefinition::new(name),
                Arc::new(LogHandler::new(queue, sink.clone())),
            )
        })
}

/// Installs the topology and consumes until the session is stopped.
pub async fn run(session: &ExchangeSession, sink: Arc<dyn LogSink>) -> Result<(), AmqpError> {
    let names = install(session).await?;
    let mut dispatcher = register(session.dispatcher(), &names, sink);

    info!(queues = ?names, "log consumer ready");
    dispatcher.consume_blocking().await
}

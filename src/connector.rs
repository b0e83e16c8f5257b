// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Connector
//!
//! An `ExchangeConnector` owns one broker configuration and one exchange.
//! Entering it opens a connection (retrying while the broker is unreachable),
//! opens a channel on it and declares the exchange, yielding an
//! `ExchangeSession`. Everything else happens through the session: declaring
//! queues, publishing and consuming.
//!
//! `ExchangeSession::exit` releases the session in a fixed order:
//! 1. stop the dispatch loop and cancel its broker consumers;
//! 2. close the channel;
//! 3. close the connection.
//!
//! Every step runs even when an earlier one failed. The first failure is
//! returned and the rest are logged. `ExchangeConnector::scope` runs a closure
//! between enter and exit, so the session is released whatever the closure
//! returns. A session dropped without `exit` runs the same teardown as a
//! background task.
//!
//! ```ignore
//! let connector = ExchangeConnector::new(cfg, ExchangeDefinition::new("producer_log").topic());
//! connector
//!     .scope(|session| Box::pin(async move { session.publish(b"hello", "user.info").await }))
//!     .await?;
//! ```

use crate::{
    broker::{AmqpChannel, AmqpConnection, Broker},
    channel::LapinBroker,
    config::Configs,
    dispatcher::{RabbitMQDispatcher, StopHandle},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::{Publisher, RabbitMQPublisher},
    queue::QueueDefinition,
    topology::{AmqpTopology, Topology},
};
use futures_util::future::BoxFuture;
use opentelemetry::Context;
use std::sync::Arc;
use tokio::{runtime::Handle, time::sleep};
use tracing::{debug, error, info, warn};

/// Opens a connection, trying up to `connection_attempts` times with
/// `retry_delay` between attempts.
///
/// # Parameters
/// * `broker` - Broker to connect to
/// * `cfg` - Connection settings; zero attempts counts as one
///
/// # Returns
/// * `Result<Box<dyn AmqpConnection>, AmqpError>` - The open connection, or
///   `AmqpError::ConnectionError` carrying the number of attempts made
pub async fn open_connection(
    broker: &dyn Broker,
    cfg: &Configs,
) -> Result<Box<dyn AmqpConnection>, AmqpError> {
    let attempts = cfg.rabbitmq.connection_attempts.max(1);
    let uri = cfg.rabbitmq.uri();

    for attempt in 1..=attempts {
        debug!(
            attempt,
            attempts,
            host = %cfg.rabbitmq.host,
            port = cfg.rabbitmq.port,
            "creating amqp connection..."
        );

        match broker.connect(&uri, &cfg.app.name).await {
            Ok(conn) => {
                info!(attempt, "amqp connected");
                return Ok(conn);
            }
            Err(err) => {
                warn!(attempt, attempts, error = err.to_string(), "failure to connect");
                if attempt < attempts {
                    sleep(cfg.rabbitmq.retry_delay()).await;
                }
            }
        }
    }

    error!(attempts, "broker unreachable, giving up");
    Err(AmqpError::ConnectionError(attempts))
}

/// Connection settings plus the exchange every session declares.
pub struct ExchangeConnector {
    cfg: Configs,
    exchange: ExchangeDefinition,
    broker: Arc<dyn Broker>,
}

impl ExchangeConnector {
    /// Creates a connector talking to RabbitMQ through lapin.
    ///
    /// # Parameters
    /// * `cfg` - Broker and application settings
    /// * `exchange` - Exchange declared by every session
    ///
    /// # Returns
    /// * `ExchangeConnector` - A connector; nothing is opened until `enter`
    pub fn new(cfg: Configs, exchange: ExchangeDefinition) -> Self {
        Self::with_broker(cfg, exchange, Arc::new(LapinBroker))
    }

    /// Creates a connector on an arbitrary broker implementation, such as
    /// `memory::MemoryBroker`.
    ///
    /// # Parameters
    /// * `cfg` - Broker and application settings
    /// * `exchange` - Exchange declared by every session
    /// * `broker` - Broker used to open connections
    ///
    /// # Returns
    /// * `ExchangeConnector` - A connector; nothing is opened until `enter`
    pub fn with_broker(cfg: Configs, exchange: ExchangeDefinition, broker: Arc<dyn Broker>) -> Self {
        ExchangeConnector {
            cfg,
            exchange,
            broker,
        }
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn configs(&self) -> &Configs {
        &self.cfg
    }

    /// Opens a session: connection (with retries), channel, then the
    /// exchange declaration.
    ///
    /// # Returns
    /// * `Result<ExchangeSession, AmqpError>` - The open session. When the
    ///   channel or the exchange cannot be created, whatever was opened is
    ///   closed before the error is returned
    pub async fn enter(&self) -> Result<ExchangeSession, AmqpError> {
        let connection = open_connection(self.broker.as_ref(), &self.cfg).await?;

        debug!("creating amqp channel...");
        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                if let Err(close_err) = connection.close().await {
                    warn!(error = close_err.to_string(), "failure to close the connection");
                }
                return Err(err);
            }
        };

        let session = ExchangeSession {
            connection: Some(connection),
            channel,
            exchange: self.exchange.clone(),
            stop: StopHandle::new(),
        };

        if let Err(err) = session.registrar().declare_exchange().await {
            error!(
                exchange = %self.exchange.name,
                error = err.to_string(),
                "failure to declare the exchange"
            );
            if let Err(exit_err) = session.exit().await {
                warn!(error = exit_err.to_string(), "failure to release the session");
            }
            return Err(err);
        }

        info!(
            exchange = %self.exchange.name,
            kind = %self.exchange.kind,
            "exchange session opened"
        );
        Ok(session)
    }

    /// Runs `f` inside a session and releases it afterwards.
    ///
    /// When the returned future is dropped before completion (timeout,
    /// `select!`, task abort) the session is released in the background on
    /// the current runtime.
    ///
    /// # Parameters
    /// * `f` - Body receiving the open session
    ///
    /// # Returns
    /// * `Result<T, AmqpError>` - The body's value. An error from `f` takes
    ///   precedence over an error while releasing
    pub async fn scope<T, F>(&self, f: F) -> Result<T, AmqpError>
    where
        F: for<'s> FnOnce(&'s ExchangeSession) -> BoxFuture<'s, Result<T, AmqpError>>,
    {
        let session = self.enter().await?;
        let result = f(&session).await;
        let exited = session.exit().await;

        match (result, exited) {
            (Err(err), Err(exit_err)) => {
                warn!(error = exit_err.to_string(), "failure to release the session");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(_), Err(exit_err)) => Err(exit_err),
            (Ok(value), Ok(())) => Ok(value),
        }
    }
}

/// An open connection and channel with the exchange declared.
///
/// Release it with `exit`. A session dropped without `exit` spawns the same
/// teardown on the current tokio runtime.
pub struct ExchangeSession {
    /// `None` once the teardown took it.
    connection: Option<Box<dyn AmqpConnection>>,
    channel: Arc<dyn AmqpChannel>,
    exchange: ExchangeDefinition,
    stop: StopHandle,
}

impl ExchangeSession {
    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    /// Raw channel of this session, for operations the session does not wrap.
    pub fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.channel.clone()
    }

    /// Queue registrar bound to this session's exchange.
    pub fn registrar(&self) -> AmqpTopology {
        AmqpTopology::new(self.channel.clone(), &self.exchange)
    }

    /// Declares a durable queue bound to the exchange.
    ///
    /// # Parameters
    /// * `name` - Queue name; empty lets the broker generate one
    /// * `binding_key` - Binding key; `None` binds with the resolved name
    ///
    /// # Returns
    /// * `Result<String, AmqpError>` - The resolved queue name
    pub async fn declare_queue(
        &self,
        name: &str,
        binding_key: Option<&str>,
    ) -> Result<String, AmqpError> {
        let mut def = QueueDefinition::new(name);
        if let Some(key) = binding_key {
            def = def.binding_key(key);
        }

        self.registrar().declare_queue(&def).await
    }

    /// Publisher sending to this session's exchange. No content type is set
    /// unless the caller adds one.
    pub fn publisher(&self) -> RabbitMQPublisher {
        RabbitMQPublisher::new(self.channel.clone(), &self.exchange.name)
    }

    /// Publishes `body` under `routing_key` with the current trace context.
    ///
    /// # Parameters
    /// * `body` - Raw message bytes
    /// * `routing_key` - Routing key; may be empty
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - Success once the broker accepted the
    ///   message. An unroutable message is still a success
    pub async fn publish(&self, body: &[u8], routing_key: &str) -> Result<(), AmqpError> {
        self.publisher()
            .publish(&Context::current(), routing_key, body)
            .await
    }

    /// A dispatcher consuming on this session's channel. Exiting the session
    /// stops it.
    pub fn dispatcher(&self) -> RabbitMQDispatcher {
        RabbitMQDispatcher::new(self.channel.clone(), self.stop.clone())
    }

    /// Handle stopping every dispatcher created by this session. Safe to
    /// move to a signal handler or another task.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop_consuming(&self) {
        self.stop.stop();
    }

    /// Releases the session: stops consuming and cancels consumers, closes
    /// the channel, then the connection.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - The first failure; every step runs
    ///   regardless and later failures are logged
    pub async fn exit(mut self) -> Result<(), AmqpError> {
        debug!("closing exchange session...");

        match self.connection.take() {
            Some(connection) => teardown(&self.stop, self.channel.as_ref(), connection).await,
            None => Ok(()),
        }
    }
}

async fn teardown(
    stop: &StopHandle,
    channel: &dyn AmqpChannel,
    connection: Box<dyn AmqpConnection>,
) -> Result<(), AmqpError> {
    stop.stop();

    let mut first = None;
    keep_first(&mut first, channel.cancel_consumers().await);
    keep_first(&mut first, channel.close().await);
    keep_first(&mut first, connection.close().await);

    match first {
        Some(err) => Err(err),
        None => {
            debug!("exchange session closed");
            Ok(())
        }
    }
}

fn keep_first(first: &mut Option<AmqpError>, result: Result<(), AmqpError>) {
    let Err(err) = result else {
        return;
    };

    if first.is_none() {
        *first = Some(err);
    } else {
        warn!(error = err.to_string(), "teardown failure after an earlier one");
    }
}

impl Drop for ExchangeSession {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        self.stop.stop();

        let Ok(runtime) = Handle::try_current() else {
            warn!(
                exchange = %self.exchange.name,
                "exchange session dropped outside a runtime, channel and connection were not closed"
            );
            return;
        };

        warn!(
            exchange = %self.exchange.name,
            "exchange session dropped without exit, releasing it in the background"
        );

        let stop = self.stop.clone();
        let channel = self.channel.clone();
        runtime.spawn(async move {
            if let Err(err) = teardown(&stop, channel.as_ref(), connection).await {
                warn!(error = err.to_string(), "failure to release the dropped session");
            }
        });
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Handlers are registered per queue, at most one per queue (the last
//! registration wins). `consume_blocking` starts one broker consumer per
//! registered queue, merges their deliveries into a single stream and runs the
//! matching handler for each delivery, one at a time, until it is stopped.
//!
//! The loop ends when:
//! - the `StopHandle` is triggered (checked between deliveries, so a running
//!   handler always finishes first);
//! - a handler fails, which is returned as `AmqpError::HandlerError`;
//! - the delivery stream fails or the broker cancels every consumer.
//!
//! Broker consumers started by the loop are cancelled on every exit path.

use crate::{
    broker::{AmqpChannel, DeliveryStream},
    consumer::consume,
    errors::AmqpError,
    handler::ConsumerHandler,
};
use async_trait::async_trait;
use futures_util::{
    stream::{select_all, SelectAll},
    StreamExt,
};
use opentelemetry::global;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Cooperative, idempotent stop signal shared between a dispatcher and
/// whoever needs to end it (signal handler, session exit).
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for StopHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        StopHandle { tx: Arc::new(tx) }
    }
}

impl StopHandle {
    /// Creates a handle in the running state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the dispatch loop to stop. Calling it again has no effect.
    pub fn stop(&self) {
        if !self.tx.send_replace(true) {
            debug!("stop requested");
        }
    }

    /// # Returns
    /// * `bool` - Whether `stop` was called on this handle or a clone of it
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the handle has been stopped.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Registration options for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherDefinition {
    pub(crate) queue: String,
    pub(crate) auto_ack: bool,
}

impl DispatcherDefinition {
    /// Handles `queue` with broker-side acknowledgement before the handler
    /// runs (at-most-once).
    ///
    /// # Parameters
    /// * `queue` - Name of an already declared queue
    ///
    /// # Returns
    /// * `DispatcherDefinition` - Registration options with auto-ack enabled
    pub fn new(queue: &str) -> DispatcherDefinition {
        DispatcherDefinition {
            queue: queue.to_owned(),
            auto_ack: true,
        }
    }

    /// The handler settles every delivery itself.
    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_auto_ack(&self) -> bool {
        self.auto_ack
    }
}

/// A queue registration together with its handler.
#[derive(Clone)]
pub struct RabbitMQDispatcherDefinition {
    pub(crate) def: DispatcherDefinition,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
}

/// Lifecycle of a dispatcher. It only moves forward and `Stopped` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    /// Nothing registered yet.
    Idle,
    /// At least one handler registered, not consuming.
    Configuring,
    /// Broker consumers started, the loop is running.
    Consuming,
    Stopped,
}

/// Interface for registering handlers and running the dispatch loop.
#[async_trait]
pub trait Dispatcher: Send {
    /// Registers `handler` for the queue named in `def`, replacing any
    /// previous registration for that queue.
    ///
    /// # Parameters
    /// * `def` - Queue and acknowledgement mode
    /// * `handler` - Handler invoked for every delivery from that queue
    ///
    /// # Returns
    /// * `Self` - The dispatcher, for chaining
    fn register(self, def: &DispatcherDefinition, handler: Arc<dyn ConsumerHandler>) -> Self
    where
        Self: Sized;

    /// Starts one consumer per registered queue and dispatches deliveries
    /// until stopped or a handler fails. A dispatcher that already stopped,
    /// or that has no handlers, returns `Ok(())` at once.
    ///
    /// # Returns
    /// * `Result<(), AmqpError>` - `Ok` after a stop request or when the
    ///   broker cancelled every consumer. `AmqpError::HandlerError` when a
    ///   handler failed. Consumers are cancelled on every exit
    async fn consume_blocking(&mut self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Dispatcher trait.
pub struct RabbitMQDispatcher {
    channel: Arc<dyn AmqpChannel>,
    stop: StopHandle,
    state: DispatcherState,
    pub(crate) dispatchers_def: HashMap<String, RabbitMQDispatcherDefinition>,
}

impl RabbitMQDispatcher {
    /// Creates an idle dispatcher.
    ///
    /// # Parameters
    /// * `channel` - Channel the consumers are started on
    /// * `stop` - Handle ending the dispatch loop
    ///
    /// # Returns
    /// * `RabbitMQDispatcher` - A dispatcher in `DispatcherState::Idle`
    pub fn new(channel: Arc<dyn AmqpChannel>, stop: StopHandle) -> Self {
        RabbitMQDispatcher {
            channel,
            stop,
            state: DispatcherState::Idle,
            dispatchers_def: HashMap::default(),
        }
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    /// Handle ending this dispatcher's loop, shared with every clone.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Names of the queues with a registered handler, sorted.
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.dispatchers_def.keys().cloned().collect();
        queues.sort();
        queues
    }

    async fn dispatch(&self, mut deliveries: SelectAll<DeliveryStream>) -> Result<(), AmqpError> {
        let tracer = global::tracer("amqp consumer");

        loop {
            tokio::select! {
                biased;

                _ = self.stop.stopped() => {
                    debug!("stop requested, leaving the consume loop");
                    return Ok(());
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => consume(&tracer, &delivery, &self.dispatchers_def).await?,
                    Some(Err(err)) => {
                        error!(error = err.to_string(), "error receiving msg");
                        return Err(err);
                    }
                    None => {
                        warn!("every consumer was cancelled by the broker");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn cancel(&self, tags: &[String]) {
        for tag in tags {
            if let Err(err) = self.channel.basic_cancel(tag).await {
                warn!(consumer_tag = %tag, error = err.to_string(), "error cancelling consumer");
            }
        }
    }
}

#[async_trait]
impl Dispatcher for RabbitMQDispatcher {
    fn register(mut self, def: &DispatcherDefinition, handler: Arc<dyn ConsumerHandler>) -> Self {
        let previous = self.dispatchers_def.insert(
            def.queue.clone(),
            RabbitMQDispatcherDefinition {
                def: def.clone(),
                handler,
            },
        );
        if previous.is_some() {
            debug!(queue = %def.queue, "replacing the handler registered for queue");
        }

        if self.state == DispatcherState::Idle {
            self.state = DispatcherState::Configuring;
        }

        self
    }

    async fn consume_blocking(&mut self) -> Result<(), AmqpError> {
        if self.state == DispatcherState::Stopped || self.stop.is_stopped() {
            debug!("dispatcher already stopped");
            self.state = DispatcherState::Stopped;
            return Ok(());
        }

        if self.dispatchers_def.is_empty() {
            warn!("no handlers registered, nothing to consume");
            self.state = DispatcherState::Stopped;
            return Ok(());
        }

        let mut tags = Vec::with_capacity(self.dispatchers_def.len());
        let mut streams = Vec::with_capacity(self.dispatchers_def.len());

        for queue in self.queues() {
            let auto_ack = self.dispatchers_def[&queue].def.auto_ack;
            let tag = format!("{}-{}", queue, Uuid::new_v4());

            match self.channel.basic_consume(&queue, &tag, auto_ack).await {
                Ok(stream) => {
                    debug!(queue = %queue, consumer_tag = %tag, auto_ack, "consumer started");
                    tags.push(tag);
                    streams.push(stream);
                }
                Err(err) => {
                    error!(queue = %queue, error = err.to_string(), "failure to create the consumer");
                    self.cancel(&tags).await;
                    self.state = DispatcherState::Stopped;
                    return Err(err);
                }
            }
        }

        self.state = DispatcherState::Consuming;
        let result = self.dispatch(select_all(streams)).await;

        self.cancel(&tags).await;
        self.state = DispatcherState::Stopped;

        result
    }
}

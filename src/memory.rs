// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process implementation of the broker traits that routes like
//! RabbitMQ does for fanout, direct and topic exchanges. It backs the test
//! suite and lets the connector run without a broker.
//!
//! Behaviour mirrored from the real broker:
//! - redeclaring an exchange with different parameters fails;
//! - an empty queue name yields a generated `amq.gen-…` name;
//! - a message is enqueued once per matching queue, whatever the number of
//!   matching bindings, and dropped silently when nothing matches;
//! - the default exchange (`""`) routes to the queue named by the routing key;
//! - manual-ack deliveries stay pending until settled and are requeued when
//!   their channel closes;
//! - `restart` drops transient exchanges, queues and messages.

use crate::{
    broker::{
        AmqpChannel, AmqpConnection, Broker, Delivery, DeliveryAcker, DeliveryMode,
        DeliveryStream, MessageProperties,
    },
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::QueueBinding,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of broker-generated queue names.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

type DeliverySender = mpsc::UnboundedSender<Result<Delivery, AmqpError>>;

#[derive(Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    data: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    auto_ack: bool,
    sender: DeliverySender,
}

struct Unacked {
    channel_id: u64,
    message: StoredMessage,
}

struct QueueState {
    durable: bool,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<u64, Unacked>,
}

impl QueueState {
    fn new(durable: bool) -> Self {
        QueueState {
            durable,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            unacked: HashMap::new(),
        }
    }
}

struct BrokerState {
    this: Weak<Mutex<BrokerState>>,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: BTreeSet<QueueBinding>,
    next_delivery_tag: u64,
    next_channel_id: u64,
    /// Bumped on restart; channels opened before it are dead.
    epoch: u64,
    failing_connects: u32,
    connections_opened: usize,
    connections_closed: usize,
    channels_open: usize,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> Result<BTreeSet<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| routing_key.to_owned())
                .into_iter()
                .collect());
        }

        let Some(def) = self.exchanges.get(exchange) else {
            warn!(exchange, "publish to a missing exchange");
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        };

        Ok(self
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange)
            .filter(|b| def.kind.routes(&b.routing_key, routing_key))
            .map(|b| b.queue_name.clone())
            .collect())
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage, front: bool) {
        if let Some(state) = self.queues.get_mut(queue) {
            if front {
                state.messages.push_front(message);
            } else {
                state.messages.push_back(message);
            }
        }
        self.pump(queue);
    }

    /// Hands ready messages to the queue's consumers, round robin.
    fn pump(&mut self, queue: &str) {
        let this = self.this.clone();

        loop {
            let tag = self.next_delivery_tag + 1;
            let Some(state) = self.queues.get_mut(queue) else {
                return;
            };
            if state.consumers.is_empty() {
                return;
            }
            let Some(message) = state.messages.pop_front() else {
                return;
            };

            let index = state.next_consumer % state.consumers.len();
            let slot = &state.consumers[index];

            let delivery = Delivery {
                delivery_tag: tag,
                queue: queue.to_owned(),
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                data: message.data.clone(),
                properties: message.properties.clone(),
                auto_ack: slot.auto_ack,
                acker: Arc::new(MemoryAcker {
                    state: this.clone(),
                    queue: queue.to_owned(),
                    delivery_tag: tag,
                }),
            };

            let auto_ack = slot.auto_ack;
            let channel_id = slot.channel_id;

            if slot.sender.send(Ok(delivery)).is_err() {
                debug!(consumer_tag = %slot.tag, "consumer stream dropped, removing consumer");
                state.consumers.remove(index);
                state.messages.push_front(message);
                continue;
            }

            self.next_delivery_tag = tag;
            state.next_consumer = index + 1;
            if !auto_ack {
                state.unacked.insert(
                    tag,
                    Unacked {
                        channel_id,
                        message,
                    },
                );
            }
        }
    }

    fn remove_consumers<F>(&mut self, predicate: F)
    where
        F: Fn(&ConsumerSlot) -> bool,
    {
        for state in self.queues.values_mut() {
            state.consumers.retain(|slot| !predicate(slot));
        }
    }

    /// Puts back every unsettled delivery of a closed channel.
    fn requeue_channel(&mut self, channel_id: u64) {
        let names: Vec<String> = self.queues.keys().cloned().collect();

        for name in names {
            let Some(state) = self.queues.get_mut(&name) else {
                continue;
            };

            let mut tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, unacked)| unacked.channel_id == channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();

            for tag in tags.into_iter().rev() {
                if let Some(mut unacked) = state.unacked.remove(&tag) {
                    unacked.message.redelivered = true;
                    state.messages.push_front(unacked.message);
                }
            }

            self.pump(&name);
        }
    }

    fn settle(&mut self, queue: &str, delivery_tag: u64, requeue: bool) -> bool {
        let Some(state) = self.queues.get_mut(queue) else {
            return false;
        };
        let Some(mut unacked) = state.unacked.remove(&delivery_tag) else {
            return false;
        };

        if requeue {
            unacked.message.redelivered = true;
            self.enqueue(queue, unacked.message, true);
        }

        true
    }
}

/// An in-process broker. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let state = Arc::new_cyclic(|this| {
            Mutex::new(BrokerState {
                this: this.clone(),
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: BTreeSet::new(),
                next_delivery_tag: 0,
                next_channel_id: 0,
                epoch: 0,
                failing_connects: 0,
                connections_opened: 0,
                connections_closed: 0,
                channels_open: 0,
            })
        });

        MemoryBroker { state }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Makes the next `attempts` connection attempts fail as if the broker
    /// were unreachable.
    pub fn fail_next_connects(&self, attempts: u32) {
        self.lock().failing_connects = attempts;
    }

    /// Number of connections successfully opened so far.
    pub fn connections_opened(&self) -> usize {
        self.lock().connections_opened
    }

    /// Connections opened and not closed by their client yet.
    pub fn open_connections(&self) -> usize {
        let state = self.lock();
        state.connections_opened - state.connections_closed
    }

    /// Channels created and not closed yet, by their client or their
    /// connection.
    pub fn open_channels(&self) -> usize {
        self.lock().channels_open
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ready messages waiting in `queue`, `None` when the queue does not exist.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.messages.len())
    }

    /// Deliveries handed out in manual-ack mode and not settled yet.
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.consumers.len())
    }

    pub fn bindings(&self, queue: &str) -> Vec<QueueBinding> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue_name == queue)
            .cloned()
            .collect()
    }

    /// Simulates a broker restart: open channels die, transient exchanges,
    /// queues and messages are lost, unsettled persistent messages come back.
    pub fn restart(&self) {
        let mut state = self.lock();
        state.epoch += 1;

        state.exchanges.retain(|_, def| def.durable);
        state.queues.retain(|_, queue| queue.durable);

        for queue in state.queues.values_mut() {
            queue.consumers.clear();

            let mut tags: Vec<u64> = queue.unacked.keys().copied().collect();
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some(mut unacked) = queue.unacked.remove(&tag) {
                    unacked.message.redelivered = true;
                    queue.messages.push_front(unacked.message);
                }
            }

            queue
                .messages
                .retain(|m| m.properties.delivery_mode == DeliveryMode::Persistent);
        }

        let BrokerState {
            bindings,
            exchanges,
            queues,
            ..
        } = &mut *state;
        bindings.retain(|b| {
            exchanges.contains_key(&b.exchange_name) && queues.contains_key(&b.queue_name)
        });
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(
        &self,
        _uri: &str,
        connection_name: &str,
    ) -> Result<Box<dyn AmqpConnection>, AmqpError> {
        let mut state = self.lock();

        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            debug!(connection_name, "memory broker refusing connection");
            return Err(AmqpError::ConnectionError(1));
        }

        state.connections_opened += 1;
        debug!(connection_name, "memory broker connection opened");

        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
            closed: AtomicBool::new(false),
            channels: Mutex::new(Vec::new()),
        }))
    }
}

pub struct MemoryConnection {
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError);
        }

        let (id, epoch) = {
            let mut state = lock(&self.state);
            state.next_channel_id += 1;
            state.channels_open += 1;
            (state.next_channel_id, state.epoch)
        };

        let channel = Arc::new(MemoryChannel {
            id,
            epoch,
            state: self.state.clone(),
            closed: AtomicBool::new(false),
        });

        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(channel.clone());

        Ok(channel)
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::CloseConnectionError);
        }
        lock(&self.state).connections_closed += 1;

        let channels: Vec<Arc<MemoryChannel>> = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();

        for channel in channels {
            channel.shutdown();
        }

        Ok(())
    }
}

pub struct MemoryChannel {
    id: u64,
    epoch: u64,
    state: Arc<Mutex<BrokerState>>,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = lock(&self.state);
        if self.closed.load(Ordering::SeqCst) || state.epoch != self.epoch {
            return Err(AmqpError::ChannelError);
        }
        Ok(state)
    }

    /// Returns false when the channel was already closed.
    fn shutdown(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }

        let mut state = lock(&self.state);
        state.channels_open = state.channels_open.saturating_sub(1);
        if state.epoch == self.epoch {
            let id = self.id;
            state.remove_consumers(|slot| slot.channel_id == id);
            state.requeue_channel(id);
        }
        true
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if def.name.is_empty() {
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        if let Some(existing) = state.exchanges.get(&def.name) {
            if existing == def {
                return Ok(());
            }
            warn!(
                name = %def.name,
                existing = %existing.kind,
                requested = %def.kind,
                "exchange exists with different parameters"
            );
            return Err(AmqpError::ExchangeConflictError(def.name.clone()));
        }

        state.exchanges.insert(def.name.clone(), def.clone());
        Ok(())
    }

    async fn queue_declare(&self, name: &str, durable: bool) -> Result<String, AmqpError> {
        let mut state = self.open_state()?;

        let name = if name.is_empty() {
            format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4().simple())
        } else {
            name.to_owned()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.durable != durable {
                warn!(name = %name, "queue exists with different durability");
                return Err(AmqpError::DeclareQueueError(name));
            }
            return Ok(name);
        }

        state.queues.insert(name.clone(), QueueState::new(durable));
        Ok(name)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state
            .bindings
            .insert(QueueBinding::new(queue, exchange, routing_key));
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        data: &[u8],
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let targets = state.route(exchange, routing_key)?;

        if targets.is_empty() {
            debug!(exchange, routing_key, "no binding matched, message dropped");
            return Ok(());
        }

        let message = StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            data: data.to_vec(),
            properties,
            redelivered: false,
        };

        for queue in targets {
            state.enqueue(&queue, message.clone(), false);
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.open_state()?;

        let Some(queue_state) = state.queues.get_mut(queue) else {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_owned(),
            channel_id: self.id,
            auto_ack,
            sender,
        });
        state.pump(queue);

        let deliveries = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        });

        Ok(deliveries.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        state.remove_consumers(|slot| slot.tag == consumer_tag);
        Ok(())
    }

    async fn cancel_consumers(&self) -> Result<(), AmqpError> {
        let mut state = self.open_state()?;
        let id = self.id;
        state.remove_consumers(|slot| slot.channel_id == id);
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.shutdown() {
            Ok(())
        } else {
            Err(AmqpError::CloseChannelError)
        }
    }
}

struct MemoryAcker {
    state: Weak<Mutex<BrokerState>>,
    queue: String,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let settled = lock(&state).settle(&self.queue, self.delivery_tag, requeue);
        settled
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        if self.settle(false) {
            Ok(())
        } else {
            Err(AmqpError::AckMessageError)
        }
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        if self.settle(requeue) {
            Ok(())
        } else {
            Err(AmqpError::NackMessageError)
        }
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.nack(requeue).await
    }
}

//! Broker engine
//!
//! In-process exchange/queue broker with AMQP 0-9-1 semantics for the subset
//! the pub/sub core uses:
//! - direct, topic and fanout exchanges, plus the nameless default exchange
//!   that routes straight to the queue named by the routing key
//! - queue declaration with equivalence checks and exclusive ownership
//! - per-channel prefetch and round-robin dispatch between consumers
//! - single-delivery ack, nack with requeue (to the head of the queue, marked
//!   redelivered) and nack without requeue (dead-lettered when the queue has a
//!   dead-letter exchange, dropped otherwise)
//! - channel close requeues everything its consumers still hold; connection
//!   close also deletes the connection's exclusive queues
//!
//! Concurrency and usage notes:
//! - The engine is synchronous and lives behind `Arc<Mutex<Broker>>`.
//!   Delivery happens by pushing envelopes into unbounded per-consumer
//!   channels while the lock is held; nothing here awaits.
//! - Envelopes carry a weak handle back to the engine so that acking after
//!   the broker is gone fails cleanly instead of keeping it alive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::message::StoredMessage;
use crate::broker::topic::routes_to;
use crate::transport::{
    Acker, Envelope, ExchangeKind, OutboundMessage, QueueArguments, QueueFlags, QueueInfo,
};
use crate::utils::error::BrokerError;

pub type ConnectionId = u64;
pub type ChannelId = u64;

pub(crate) type DeliverySender = UnboundedSender<Result<Envelope, BrokerError>>;
pub(crate) type DeliveryReceiver = UnboundedReceiver<Result<Envelope, BrokerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Debug)]
struct Queue {
    flags: QueueFlags,
    arguments: QueueArguments,
    owner: Option<ConnectionId>,
    ready: VecDeque<StoredMessage>,
    /// Consumer tags in round-robin order.
    consumers: VecDeque<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

#[derive(Debug)]
struct ChannelState {
    connection: ConnectionId,
    prefetch: u16,
    consumers: Vec<String>,
}

#[derive(Debug)]
struct Consumer {
    queue: String,
    channel: ChannelId,
    prefetch: u16,
    sender: DeliverySender,
    unacked: HashMap<u64, StoredMessage>,
}

impl Consumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < usize::from(self.prefetch)
    }
}

#[derive(Debug)]
pub struct Broker {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    connections: HashSet<ConnectionId>,
    channels: HashMap<ChannelId, ChannelState>,
    consumers: HashMap<String, Consumer>,
    next_id: u64,
    next_delivery_tag: u64,
    handle: Weak<Mutex<Broker>>,
}

impl Broker {
    /// Create an engine wrapped in the handle every connection shares.
    pub fn shared() -> Arc<Mutex<Broker>> {
        Arc::new_cyclic(|handle| {
            Mutex::new(Broker {
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                bindings: Vec::new(),
                connections: HashSet::new(),
                channels: HashMap::new(),
                consumers: HashMap::new(),
                next_id: 1,
                next_delivery_tag: 1,
                handle: handle.clone(),
            })
        })
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn open_connection(&mut self) -> ConnectionId {
        let id = self.next_id();
        self.connections.insert(id);
        id
    }

    pub fn open_channel(&mut self, connection: ConnectionId) -> Result<ChannelId, BrokerError> {
        if !self.connections.contains(&connection) {
            return Err(BrokerError::ChannelClosed);
        }
        let id = self.next_id();
        self.channels.insert(
            id,
            ChannelState {
                connection,
                prefetch: 0,
                consumers: Vec::new(),
            },
        );
        Ok(id)
    }

    fn connection_of(&self, channel: ChannelId) -> Result<ConnectionId, BrokerError> {
        self.channels
            .get(&channel)
            .map(|c| c.connection)
            .ok_or(BrokerError::ChannelClosed)
    }

    fn check_access(&self, queue: &str, connection: ConnectionId) -> Result<&Queue, BrokerError> {
        let q = self
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))?;
        match q.owner {
            Some(owner) if q.flags.exclusive && owner != connection => Err(
                BrokerError::ResourceLocked(format!("queue '{queue}' is exclusive to another connection")),
            ),
            _ => Ok(q),
        }
    }

    pub fn declare_exchange(
        &mut self,
        channel: ChannelId,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        self.connection_of(channel)?;
        let wanted = Exchange { kind, durable };
        match self.exchanges.get(name) {
            Some(existing) if *existing != wanted => Err(BrokerError::PreconditionFailed(format!(
                "exchange '{name}' already declared as {:?} (durable: {})",
                existing.kind, existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(name.to_string(), wanted);
                Ok(())
            }
        }
    }

    pub fn declare_queue(
        &mut self,
        channel: ChannelId,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<QueueInfo, BrokerError> {
        let connection = self.connection_of(channel)?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4())
        } else {
            name.to_string()
        };

        if self.queues.contains_key(&name) {
            let existing = self.check_access(&name, connection)?;
            if existing.flags != flags || existing.arguments != *arguments {
                return Err(BrokerError::PreconditionFailed(format!(
                    "inequivalent declaration for queue '{name}': have {:?} {:?}, asked {flags:?} {arguments:?}",
                    existing.flags, existing.arguments
                )));
            }
        } else {
            self.queues.insert(
                name.clone(),
                Queue {
                    flags,
                    arguments: arguments.clone(),
                    owner: flags.exclusive.then_some(connection),
                    ready: VecDeque::new(),
                    consumers: VecDeque::new(),
                },
            );
        }

        let queue = &self.queues[&name];
        Ok(QueueInfo {
            message_count: queue.ready.len() as u32,
            consumer_count: queue.consumers.len() as u32,
            name,
        })
    }

    pub fn bind_queue(
        &mut self,
        channel: ChannelId,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let connection = self.connection_of(channel)?;
        self.check_access(queue, connection)?;
        if !self.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange '{exchange}'")));
        }
        let binding = Binding {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
        Ok(())
    }

    pub fn set_prefetch(&mut self, channel: ChannelId, count: u16) -> Result<(), BrokerError> {
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(BrokerError::ChannelClosed)?;
        state.prefetch = count;
        Ok(())
    }

    pub(crate) fn consume(
        &mut self,
        channel: ChannelId,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<(String, DeliveryReceiver), BrokerError> {
        let connection = self.connection_of(channel)?;
        self.check_access(queue, connection)?;

        let tag = if consumer_tag.is_empty() {
            format!("ctag-{}", self.next_id())
        } else {
            consumer_tag.to_string()
        };
        if self.consumers.contains_key(&tag) {
            return Err(BrokerError::PreconditionFailed(format!(
                "consumer tag '{tag}' already in use"
            )));
        }

        let (sender, receiver) = unbounded();
        let state = self
            .channels
            .get_mut(&channel)
            .ok_or(BrokerError::ChannelClosed)?;
        state.consumers.push(tag.clone());
        let prefetch = state.prefetch;

        self.consumers.insert(
            tag.clone(),
            Consumer {
                queue: queue.to_string(),
                channel,
                prefetch,
                sender,
                unacked: HashMap::new(),
            },
        );
        if let Some(q) = self.queues.get_mut(queue) {
            q.consumers.push_back(tag.clone());
        }

        self.dispatch(queue);
        Ok((tag, receiver))
    }

    /// Route a message through `exchange`. Unroutable messages are dropped.
    pub fn publish(
        &mut self,
        channel: ChannelId,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.connection_of(channel)?;
        let stored = StoredMessage::new(exchange, routing_key, message);
        let targets = self.route(exchange, routing_key)?;
        if targets.is_empty() {
            debug!("Message to {exchange}/{routing_key} matched no queue, dropped");
        }
        self.enqueue(targets, stored);
        Ok(())
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<String>, BrokerError> {
        if exchange.is_empty() {
            return Ok(self
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default());
        }

        let kind = self
            .exchanges
            .get(exchange)
            .map(|e| e.kind)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange '{exchange}'")))?;

        let mut targets: Vec<String> = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.exchange == exchange) {
            if routes_to(kind, &binding.routing_key, routing_key)
                && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        Ok(targets)
    }

    fn enqueue(&mut self, targets: Vec<String>, message: StoredMessage) {
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.ready.push_back(message.clone());
            }
            self.dispatch(&name);
        }
    }

    /// Hand ready messages to consumers with spare prefetch capacity.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() {
                return;
            }

            let mut chosen = None;
            for _ in 0..queue.consumers.len() {
                let Some(tag) = queue.consumers.pop_front() else {
                    break;
                };
                let ready = self
                    .consumers
                    .get(&tag)
                    .is_some_and(|consumer| consumer.has_capacity());
                queue.consumers.push_back(tag.clone());
                if ready {
                    chosen = Some(tag);
                    break;
                }
            }
            let Some(tag) = chosen else {
                return;
            };
            let Some(mut message) = queue.ready.pop_front() else {
                return;
            };

            let delivery_tag = self.next_delivery_tag;
            self.next_delivery_tag += 1;

            let info = message.delivery_info(delivery_tag);
            let body = message.body.clone();
            message.delivery_count += 1;

            let acker = Arc::new(MemoryAcker {
                broker: self.handle.clone(),
                consumer_tag: tag.clone(),
                delivery_tag,
            });

            let Some(consumer) = self.consumers.get_mut(&tag) else {
                return;
            };
            consumer.unacked.insert(delivery_tag, message);
            let envelope = Envelope::new(info, body, acker);
            if consumer.sender.unbounded_send(Ok(envelope)).is_err() {
                debug!("Consumer {tag} stopped listening, cancelling it");
                self.cancel_consumer(&tag);
            }
        }
    }

    pub fn ack(&mut self, consumer_tag: &str, delivery_tag: u64) -> Result<(), BrokerError> {
        let (queue, _) = self.take_unacked(consumer_tag, delivery_tag)?;
        self.dispatch(&queue);
        Ok(())
    }

    pub fn nack(
        &mut self,
        consumer_tag: &str,
        delivery_tag: u64,
        requeue: bool,
    ) -> Result<(), BrokerError> {
        let (queue_name, mut message) = self.take_unacked(consumer_tag, delivery_tag)?;
        if requeue {
            message.redelivered = true;
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.ready.push_front(message);
            }
        } else {
            self.dead_letter(&queue_name, message);
        }
        self.dispatch(&queue_name);
        Ok(())
    }

    fn take_unacked(
        &mut self,
        consumer_tag: &str,
        delivery_tag: u64,
    ) -> Result<(String, StoredMessage), BrokerError> {
        let consumer = self
            .consumers
            .get_mut(consumer_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        let message = consumer
            .unacked
            .remove(&delivery_tag)
            .ok_or(BrokerError::UnknownDeliveryTag(delivery_tag))?;
        Ok((consumer.queue.clone(), message))
    }

    fn dead_letter(&mut self, queue_name: &str, mut message: StoredMessage) {
        let dlx = self
            .queues
            .get(queue_name)
            .and_then(|q| q.arguments.dead_letter_exchange.clone());
        let Some(dlx) = dlx else {
            debug!("Discarded message from {queue_name} has no dead-letter exchange, dropped");
            return;
        };

        match self.route(&dlx, &message.routing_key) {
            Ok(targets) => {
                message.redelivered = false;
                message.delivery_count = 0;
                message.death_count += 1;
                self.enqueue(targets, message);
            }
            Err(e) => warn!("Dead-lettering from {queue_name} to {dlx} failed: {e}"),
        }
    }

    /// Drop a consumer, returning everything it still holds to its queue in
    /// original order.
    fn cancel_consumer(&mut self, consumer_tag: &str) {
        let Some(consumer) = self.consumers.remove(consumer_tag) else {
            return;
        };
        if let Some(state) = self.channels.get_mut(&consumer.channel) {
            state.consumers.retain(|tag| tag != consumer_tag);
        }

        let Some(queue) = self.queues.get_mut(&consumer.queue) else {
            return;
        };
        queue.consumers.retain(|tag| tag != consumer_tag);

        let mut held: Vec<(u64, StoredMessage)> = consumer.unacked.into_iter().collect();
        held.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
        for (_, mut message) in held {
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        if queue.flags.auto_delete && queue.consumers.is_empty() {
            self.delete_queue(&consumer.queue);
        } else {
            self.dispatch(&consumer.queue);
        }
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
        debug!("Deleted queue {name}");
    }

    pub fn close_channel(&mut self, channel: ChannelId) {
        let Some(state) = self.channels.get(&channel) else {
            return;
        };
        let tags = state.consumers.clone();
        for tag in tags {
            self.cancel_consumer(&tag);
        }
        self.channels.remove(&channel);
    }

    pub fn close_connection(&mut self, connection: ConnectionId) {
        let channels: Vec<ChannelId> = self
            .channels
            .iter()
            .filter(|(_, state)| state.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection))
            .map(|(name, _)| name.clone())
            .collect();
        for name in exclusive {
            self.delete_queue(&name);
        }
        self.connections.remove(&connection);
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.queues.contains_key(queue)
    }

    /// Messages waiting in `queue`, not yet handed to a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Messages delivered from `queue` and not yet acked or nacked.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.consumers
            .values()
            .filter(|c| c.queue == queue)
            .map(|c| c.unacked.len())
            .sum()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    /// Snapshot of the ready messages in `queue`.
    pub fn peek(&self, queue: &str) -> Vec<StoredMessage> {
        self.queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Lock the engine, recovering from a poisoned mutex.
pub(crate) fn lock(broker: &Mutex<Broker>) -> MutexGuard<'_, Broker> {
    broker.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MemoryAcker {
    broker: Weak<Mutex<Broker>>,
    consumer_tag: String,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        let broker = self.broker.upgrade().ok_or(BrokerError::ChannelClosed)?;
        let mut broker = lock(&broker);
        broker.ack(&self.consumer_tag, self.delivery_tag)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let broker = self.broker.upgrade().ok_or(BrokerError::ChannelClosed)?;
        let mut broker = lock(&broker);
        broker.nack(&self.consumer_tag, self.delivery_tag, requeue)
    }
}

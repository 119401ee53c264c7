//! `Connection` / `Channel` implementations backed by the in-memory engine.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;

use crate::broker::engine::{Broker, ChannelId, ConnectionId, lock};
use crate::transport::{
    Channel, Connection, Deliveries, ExchangeKind, OutboundMessage, QueueArguments, QueueFlags,
    QueueInfo,
};
use crate::utils::error::BrokerError;

/// Cloneable handle on one in-process broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<Broker>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Broker::shared(),
        }
    }

    pub fn connect(&self) -> MemoryConnection {
        let id = lock(&self.inner).open_connection();
        MemoryConnection {
            id,
            broker: self.inner.clone(),
        }
    }

    /// Run `f` against the engine state, for inspection.
    pub fn inspect<R>(&self, f: impl FnOnce(&Broker) -> R) -> R {
        f(&lock(&self.inner))
    }
}

pub struct MemoryConnection {
    id: ConnectionId,
    broker: Arc<Mutex<Broker>>,
}

impl MemoryConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> Result<MemoryChannel, BrokerError> {
        let id = lock(&self.broker).open_channel(self.id)?;
        Ok(MemoryChannel {
            id,
            broker: self.broker.clone(),
        })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.broker).close_connection(self.id);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    id: ChannelId,
    broker: Arc<Mutex<Broker>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        lock(&self.broker).declare_exchange(self.id, name, kind, durable)
    }

    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<QueueInfo, BrokerError> {
        lock(&self.broker).declare_queue(self.id, name, flags, arguments)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        lock(&self.broker).bind_queue(self.id, queue, exchange, routing_key)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        lock(&self.broker).set_prefetch(self.id, count)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError> {
        let (_, receiver) = lock(&self.broker).consume(self.id, queue, consumer_tag)?;
        Ok(receiver.boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        lock(&self.broker).publish(self.id, exchange, routing_key, message)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        lock(&self.broker).close_channel(self.id);
        Ok(())
    }
}

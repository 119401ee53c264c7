//! Broker transport
//!
//! The seam between the pub/sub core and an exchange/queue broker. The core
//! only ever talks to `Connection` and `Channel`; two implementations exist:
//! - `amqp`: RabbitMQ over AMQP 0-9-1 via `lapin`
//! - `crate::broker`: an in-process engine with the same routing and
//!   acknowledgement semantics, used by the test-suite
//!
//! A channel used for consuming belongs to exactly one subscription task. A
//! channel used for publishing is shared through `crate::publisher::Publisher`,
//! which serializes writers.

pub mod amqp;
mod envelope;

pub use envelope::{Acker, DeliveryInfo, Envelope};

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::utils::error::BrokerError;

/// Stream of deliveries for one consumer. Ends when the channel or connection
/// closes.
pub type Deliveries = BoxStream<'static, Result<Envelope, BrokerError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Exact routing-key match.
    Direct,
    /// Dot-delimited pattern match with `*` and `#`.
    Topic,
    /// Every bound queue, key ignored.
    Fanout,
}

/// Queue declaration flags. Only `QueueDurability::flags` builds these for
/// subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

/// Extra queue arguments (`x-*` table entries).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// A message on its way to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub content_type: String,
    pub message_id: String,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait Connection: Send + Sync {
    type Channel: Channel;

    async fn open_channel(&self) -> Result<Self::Channel, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError>;

    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<QueueInfo, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Cap on unacknowledged deliveries for consumers started afterwards on
    /// this channel. `0` means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Start a manually-acknowledged consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError>;

    /// Fire-and-forget publish: non-mandatory, no publisher confirm awaited.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::utils::error::BrokerError;

/// Resolves one delivery on the broker side.
///
/// Implementations settle exactly the delivery they were created for, never
/// anything before it (no cumulative acks).
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// Metadata of a delivery, detached from its body and acker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: Option<i64>,
    pub delivery_tag: u64,
    pub redelivered: bool,
    /// Prior delivery attempts, when the broker tracks them.
    pub delivery_count: Option<u32>,
}

/// A delivered message. Resolving it consumes it, so it can be acked or
/// nacked at most once.
pub struct Envelope {
    pub info: DeliveryInfo,
    pub body: Vec<u8>,
    acker: Arc<dyn Acker>,
}

impl Envelope {
    pub fn new(info: DeliveryInfo, body: Vec<u8>, acker: Arc<dyn Acker>) -> Self {
        Self { info, body, acker }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.info.delivery_tag
    }

    pub fn redelivered(&self) -> bool {
        self.info.redelivered
    }

    pub fn content_type(&self) -> Option<&str> {
        self.info.content_type.as_deref()
    }

    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("info", &self.info)
            .field("body_len", &self.body.len())
            .finish()
    }
}

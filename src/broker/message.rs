//! Messages held by the in-memory broker
//!
//! `StoredMessage` is what sits in a queue between publish and delivery.
//! Fields mirror the AMQP basic properties the core relies on:
//! - `content_type`: codec tag set by the publisher
//! - `message_id` / `timestamp`: stamped by the publisher
//! - `redelivered`: set once the message has been requeued or its consumer
//!   went away while it was unacknowledged
//! - `delivery_count`: how many times the message has been handed out

use crate::transport::{DeliveryInfo, OutboundMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub message_id: String,
    pub timestamp: i64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub delivery_count: u32,
    /// Times this message has been dead-lettered.
    pub death_count: u32,
}

impl StoredMessage {
    pub fn new(exchange: &str, routing_key: &str, message: OutboundMessage) -> Self {
        Self {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            content_type: message.content_type,
            message_id: message.message_id,
            timestamp: message.timestamp,
            body: message.body,
            redelivered: false,
            delivery_count: 0,
            death_count: 0,
        }
    }

    pub fn delivery_info(&self, delivery_tag: u64) -> DeliveryInfo {
        DeliveryInfo {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            content_type: Some(self.content_type.clone()),
            message_id: Some(self.message_id.clone()),
            timestamp: Some(self.timestamp),
            delivery_tag,
            redelivered: self.redelivered,
            delivery_count: Some(self.delivery_count),
        }
    }
}

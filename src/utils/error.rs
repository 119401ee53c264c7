//! Error types used across `peril_pubsub`.
//!
//! Three layers:
//! - `BrokerError`: what a transport (AMQP or in-memory) reports for a single
//!   broker operation.
//! - `CodecError`: serialization failures, raised before the broker is
//!   contacted on publish and per-envelope on consume.
//! - `PubSubError`: what the library hands back to callers. Every variant
//!   names the operation that failed so the caller can decide whether to
//!   retry, abort one subscription, or give up entirely.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("resource locked: {0}")]
    ResourceLocked(String),

    #[error("channel is closed")]
    ChannelClosed,

    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode {content_type} payload: {reason}")]
    Encode {
        content_type: &'static str,
        reason: String,
    },

    #[error("failed to decode {content_type} payload: {reason}")]
    Decode {
        content_type: &'static str,
        reason: String,
    },

    #[error("content type mismatch: expected {expected}, found {found}")]
    ContentTypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("payload type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
}

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("could not connect to broker: {0}")]
    Connection(#[source] BrokerError),

    #[error("could not open channel: {0}")]
    Channel(#[source] BrokerError),

    #[error("could not declare exchange '{exchange}': {source}")]
    DeclareExchange {
        exchange: String,
        #[source]
        source: BrokerError,
    },

    #[error("could not declare queue '{queue}': {source}")]
    DeclareQueue {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("could not bind queue '{queue}' to '{exchange}' with key '{routing_key}': {source}")]
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    #[error("could not set prefetch to {prefetch}: {source}")]
    Qos {
        prefetch: u16,
        #[source]
        source: BrokerError,
    },

    #[error("could not consume from queue '{queue}': {source}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },

    #[error("could not publish to '{exchange}' with key '{routing_key}': {source}")]
    Publish {
        exchange: String,
        routing_key: String,
        #[source]
        source: BrokerError,
    },

    #[error("could not resolve delivery {delivery_tag}: {source}")]
    Ack {
        delivery_tag: u64,
        #[source]
        source: BrokerError,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

pub type Result<T, E = PubSubError> = std::result::Result<T, E>;

//! # Peril pub/sub
//!
//! `peril_pubsub` is a small publish/subscribe core over an AMQP
//! exchange/queue broker. Producers publish typed values to a direct or topic
//! exchange under a routing key; each subscription owns a queue bound to an
//! exchange, decodes every delivery into a typed value and settles it with the
//! handler's verdict.
//!
//! ## Core Modules
//!
//! - `topology`: queue declaration (durable or transient, always with a
//!   dead-letter exchange), bindings and the exchange set.
//! - `codec`: structured-text (JSON) and binary (bincode) encodings.
//! - `publisher`: stamps and sends encoded values.
//! - `consumer`: one background task per subscription, with an explicit
//!   shutdown handle.
//! - `ack`: the verdict a handler returns for each delivery.
//! - `transport`: the broker seam, with a RabbitMQ adapter (`lapin`).
//! - `broker`: an in-process broker implementing the same seam.
//! - `client`: a connection, its settings and a publisher in one handle.
//! - `config`, `routing`, `utils`: settings, key conventions, errors and logging.

pub mod ack;
pub mod broker;
pub mod client;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod publisher;
pub mod routing;
pub mod topology;
pub mod transport;
pub mod utils;

pub use ack::AckType;
pub use client::PubSubClient;
pub use codec::{BinaryCodec, Codec, JsonCodec};
pub use consumer::{SubscribeOptions, Subscription, SubscriptionStats};
pub use publisher::Publisher;
pub use topology::{Binding, QueueDurability};
pub use utils::error::{PubSubError, Result};

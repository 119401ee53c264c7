//! Publishing typed values
//!
//! Values are encoded before the broker is touched, so an encode failure
//! never produces a half-sent message. A successful publish means the local
//! channel accepted the message, not that any consumer received it.
//!
//! `Publisher` owns its channel behind an async mutex: concurrent producers
//! sharing one `Publisher` (it is `Clone`) take turns on the channel.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::codec::{BinaryCodec, Codec, JsonCodec};
use crate::transport::{Channel, OutboundMessage};
use crate::utils::error::{PubSubError, Result};

/// Encode `value` with `codec` and publish it to `exchange` under `routing_key`.
///
/// Callers sharing `channel` between tasks must serialize calls themselves;
/// `Publisher` does that for you.
pub async fn publish<Ch, T, K>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    value: &T,
    codec: &K,
) -> Result<()>
where
    Ch: Channel,
    T: Serialize + ?Sized,
    K: Codec,
{
    let message = outbound(value, codec)?;
    send(channel, exchange, routing_key, message).await
}

fn outbound<T, K>(value: &T, codec: &K) -> Result<OutboundMessage>
where
    T: Serialize + ?Sized,
    K: Codec,
{
    let encoded = codec.encode(value)?;
    Ok(OutboundMessage {
        content_type: encoded.content_type.to_string(),
        message_id: Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        body: encoded.body,
    })
}

async fn send<Ch: Channel>(
    channel: &Ch,
    exchange: &str,
    routing_key: &str,
    message: OutboundMessage,
) -> Result<()> {
    let message_id = message.message_id.clone();
    channel
        .publish(exchange, routing_key, message)
        .await
        .map_err(|source| PubSubError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            source,
        })?;

    debug!("Published {message_id} to {exchange}/{routing_key}");
    Ok(())
}

pub struct Publisher<Ch: Channel> {
    channel: Arc<Mutex<Ch>>,
}

impl<Ch: Channel> Clone for Publisher<Ch> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
        }
    }
}

impl<Ch: Channel> Publisher<Ch> {
    pub fn new(channel: Ch) -> Self {
        Self {
            channel: Arc::new(Mutex::new(channel)),
        }
    }

    pub async fn publish<T, K>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
        codec: &K,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
        K: Codec,
    {
        // Encode outside the lock; encode errors never wait on other writers.
        let message = outbound(value, codec)?;
        let channel = self.channel.lock().await;
        send(&*channel, exchange, routing_key, message).await
    }

    pub async fn publish_json<T>(&self, exchange: &str, routing_key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(exchange, routing_key, value, &JsonCodec).await
    }

    pub async fn publish_binary<T>(&self, exchange: &str, routing_key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publish(exchange, routing_key, value, &BinaryCodec).await
    }

    pub async fn close(&self) -> Result<()> {
        let channel = self.channel.lock().await;
        channel.close().await.map_err(PubSubError::Channel)
    }
}

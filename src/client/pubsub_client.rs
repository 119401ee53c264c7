use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::codec::{BinaryCodec, Codec, JsonCodec};
use crate::config::Settings;
use crate::consumer::{self, Handler, SubscribeOptions, Subscription};
use crate::publisher::Publisher;
use crate::topology::{self, Binding};
use crate::transport::{Channel, Connection};
use crate::utils::error::{PubSubError, Result};

/// A connected pub/sub participant.
///
/// Publishing goes through one channel owned by the client. Every
/// subscription opens its own channel on the same connection.
pub struct PubSubClient<C: Connection> {
    connection: C,
    settings: Settings,
    publisher: Publisher<C::Channel>,
}

impl<C: Connection> PubSubClient<C> {
    /// Wrap an open connection, opening the publish channel on it.
    pub async fn new(connection: C, settings: Settings) -> Result<Self> {
        let channel = connection
            .open_channel()
            .await
            .map_err(PubSubError::Channel)?;
        Ok(Self {
            connection,
            settings,
            publisher: Publisher::new(channel),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// A cloneable handle on the client's publish channel.
    pub fn publisher(&self) -> Publisher<C::Channel> {
        self.publisher.clone()
    }

    /// Declare the configured exchanges and the dead-letter queue.
    pub async fn declare_exchanges(&self) -> Result<()> {
        let channel = self
            .connection
            .open_channel()
            .await
            .map_err(PubSubError::Channel)?;
        let declared = topology::declare_exchanges(&channel, &self.settings.exchanges).await;
        let _ = channel.close().await;
        declared?;
        info!(
            "Declared exchanges {}, {} and dead-letter {}",
            self.settings.exchanges.direct,
            self.settings.exchanges.topic,
            self.settings.exchanges.dead_letter
        );
        Ok(())
    }

    pub async fn publish_json<T>(&self, exchange: &str, routing_key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publisher.publish_json(exchange, routing_key, value).await
    }

    pub async fn publish_binary<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        value: &T,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        self.publisher
            .publish_binary(exchange, routing_key, value)
            .await
    }

    /// Subscribe with options taken from the client's settings.
    pub async fn subscribe<K, T, H>(&self, binding: &Binding, codec: K, handler: H) -> Result<Subscription>
    where
        K: Codec,
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        let options = SubscribeOptions::from_settings(&self.settings);
        consumer::subscribe(&self.connection, binding, &options, codec, handler).await
    }

    pub async fn subscribe_json<T, H>(&self, binding: &Binding, handler: H) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe(binding, JsonCodec, handler).await
    }

    pub async fn subscribe_binary<T, H>(&self, binding: &Binding, handler: H) -> Result<Subscription>
    where
        T: DeserializeOwned + Send + 'static,
        H: Handler<T>,
    {
        self.subscribe(binding, BinaryCodec, handler).await
    }

    /// Close the publish channel and then the connection, which ends every
    /// subscription opened through this client.
    pub async fn close(self) -> Result<()> {
        // The connection close below covers the channel as well.
        let _ = self.publisher.close().await;
        self.connection
            .close()
            .await
            .map_err(PubSubError::Connection)
    }
}

//! AMQP 0-9-1 transport over `lapin`.
//!
//! Thin adapter: every `Channel` call maps to one AMQP method. Deliveries are
//! converted into `Envelope`s whose acker wraps lapin's per-delivery acker, so
//! `ack`/`nack` always carry `multiple = false`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, ConnectionProperties};
use tracing::{debug, info, warn};

use super::{
    Acker, Channel, Connection, Deliveries, DeliveryInfo, Envelope, ExchangeKind,
    OutboundMessage, QueueArguments, QueueFlags, QueueInfo,
};
use crate::config::AmqpSettings;
use crate::utils::error::{BrokerError, PubSubError};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const PERSISTENT: u8 = 2;

/// Bounded exponential backoff for the initial dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &AmqpSettings) -> Self {
        Self {
            attempts: settings.connect_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.connect_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

pub struct AmqpConnection {
    inner: lapin::Connection,
}

impl AmqpConnection {
    /// Dial `url`, retrying per `policy`. Returns the last error once the
    /// attempts are spent.
    pub async fn connect(url: &str, policy: RetryPolicy) -> Result<Self, PubSubError> {
        let mut attempt = 1;
        loop {
            match lapin::Connection::connect(url, ConnectionProperties::default()).await {
                Ok(inner) => {
                    info!("Connected to broker after {attempt} attempt(s)");
                    return Ok(Self { inner });
                }
                Err(e) if attempt < policy.attempts => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        "Broker connection attempt {attempt}/{} failed: {e}; retrying in {delay:?}",
                        policy.attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(PubSubError::Connection(e.into())),
            }
        }
    }

    pub async fn connect_with_settings(settings: &AmqpSettings) -> Result<Self, PubSubError> {
        Self::connect(&settings.url, RetryPolicy::from_settings(settings)).await
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> Result<AmqpChannel, BrokerError> {
        let inner = self.inner.create_channel().await?;
        Ok(AmqpChannel { inner })
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(200, "OK").await?;
        Ok(())
    }
}

pub struct AmqpChannel {
    inner: lapin::Channel,
}

fn queue_arguments(arguments: &QueueArguments) -> FieldTable {
    let mut table = FieldTable::default();
    if let Some(dlx) = &arguments.dead_letter_exchange {
        table.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
            AMQPValue::LongString(LongString::from(dlx.as_str())),
        );
    }
    table
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// The AMQP `timestamp` property is in seconds; envelopes carry milliseconds.
fn to_amqp_timestamp(millis: i64) -> u64 {
    u64::try_from(millis.div_euclid(1000)).unwrap_or(0)
}

fn from_amqp_timestamp(seconds: u64) -> i64 {
    i64::try_from(seconds)
        .map(|s| s.saturating_mul(1000))
        .unwrap_or(i64::MAX)
}

fn delivery_count(properties: &BasicProperties) -> Option<u32> {
    let headers = properties.headers().as_ref()?;
    let value = headers
        .inner()
        .get(&ShortString::from(DELIVERY_COUNT_HEADER))?;
    let count = match value {
        AMQPValue::ShortShortUInt(v) => u32::from(*v),
        AMQPValue::ShortUInt(v) => u32::from(*v),
        AMQPValue::LongUInt(v) => *v,
        AMQPValue::LongInt(v) => u32::try_from(*v).ok()?,
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok()?,
        _ => return None,
    };
    Some(count)
}

fn into_envelope(delivery: Delivery) -> Envelope {
    let properties = &delivery.properties;
    let info = DeliveryInfo {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        content_type: properties
            .content_type()
            .as_ref()
            .map(|ct| ct.as_str().to_string()),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        timestamp: (*properties.timestamp()).map(from_amqp_timestamp),
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        delivery_count: delivery_count(properties),
    };
    let acker = Arc::new(AmqpAcker {
        inner: delivery.acker,
    });
    Envelope::new(info, delivery.data, acker)
}

struct AmqpAcker {
    inner: lapin::acker::Acker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.inner
            .ack(BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.inner
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable,
            ..ExchangeDeclareOptions::default()
        };
        self.inner
            .exchange_declare(name, lapin_kind(kind), options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        flags: QueueFlags,
        arguments: &QueueArguments,
    ) -> Result<QueueInfo, BrokerError> {
        let options = QueueDeclareOptions {
            durable: flags.durable,
            auto_delete: flags.auto_delete,
            exclusive: flags.exclusive,
            ..QueueDeclareOptions::default()
        };
        let queue = self
            .inner
            .queue_declare(name, options, queue_arguments(arguments))
            .await?;
        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Deliveries, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack: false,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .inner
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer
            .map(|delivery| delivery.map(into_envelope).map_err(BrokerError::from))
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(message.content_type))
            .with_message_id(ShortString::from(message.message_id))
            .with_timestamp(to_amqp_timestamp(message.timestamp))
            .with_delivery_mode(PERSISTENT);

        // The returned confirm is dropped on purpose: no confirm mode.
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await?;
        debug!("Published {} bytes to {exchange}/{routing_key}", message.body.len());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.inner.close(200, "OK").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(30), Duration::from_millis(350));
    }

    #[test]
    fn retry_policy_always_allows_one_attempt() {
        let mut settings = crate::config::Settings::default().amqp;
        settings.connect_attempts = 0;
        assert_eq!(RetryPolicy::from_settings(&settings).attempts, 1);
    }

    #[test]
    fn dead_letter_argument_is_written() {
        let table = queue_arguments(&QueueArguments {
            dead_letter_exchange: Some("peril_dlx".to_string()),
        });
        let value = table
            .inner()
            .get(&ShortString::from(DEAD_LETTER_EXCHANGE_ARG))
            .expect("dead letter argument");
        assert_eq!(
            value,
            &AMQPValue::LongString(LongString::from("peril_dlx"))
        );
    }

    #[test]
    fn delivery_count_header_is_read() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(DELIVERY_COUNT_HEADER),
            AMQPValue::LongLongInt(4),
        );
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(delivery_count(&properties), Some(4));
        assert_eq!(delivery_count(&BasicProperties::default()), None);
    }

    #[test]
    fn timestamp_property_is_in_seconds() {
        let millis = 1_714_566_600_123;
        assert_eq!(to_amqp_timestamp(millis), 1_714_566_600);
        assert_eq!(from_amqp_timestamp(1_714_566_600), 1_714_566_600_000);
        assert_eq!(to_amqp_timestamp(-5), 0);

        let properties =
            BasicProperties::default().with_timestamp(to_amqp_timestamp(millis));
        assert_eq!(*properties.timestamp(), Some(1_714_566_600));
    }
}

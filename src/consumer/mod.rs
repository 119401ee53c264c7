//! Consumer loop
//!
//! `subscribe` declares and binds the subscription's queue, caps in-flight
//! deliveries with a prefetch limit, opens a manually-acknowledged consumer
//! and hands the delivery stream to a dedicated task. That task, for each
//! envelope in delivery order:
//! 1. decodes the body with the subscription's codec
//! 2. calls the handler and waits for its verdict
//! 3. applies the verdict to that one envelope
//!
//! Undecodable envelopes skip the handler and are requeued a bounded number
//! of times before being discarded to the dead-letter exchange (see
//! `retry`).
//!
//! Concurrency notes:
//! - One task per subscription. A slow handler only stalls its own
//!   subscription, and the broker stops delivering to it once `prefetch`
//!   envelopes are outstanding.
//! - The consuming channel is owned by the task and closed when it exits.
//!   Anything delivered but not yet settled goes back to the queue, so
//!   delivery is at-least-once.
//! - The task ends when the delivery stream closes (channel or connection
//!   shutdown) or when `Subscription::shutdown` is called. Dropping the
//!   `Subscription` detaches the task without stopping it.

mod handler;
mod retry;

pub use handler::{Handler, WithDeliveryInfo, with_delivery_info};

use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ack::AckType;
use crate::codec::{BinaryCodec, Codec, JsonCodec};
use crate::config::Settings;
use crate::topology::{Binding, declare_and_bind};
use crate::transport::{Channel, Connection, Deliveries, Envelope};
use crate::utils::error::{PubSubError, Result};
use retry::DecodeFailures;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Most unacknowledged deliveries held at once.
    pub prefetch: u16,
    /// Failed decodes before an envelope is discarded.
    pub max_decode_attempts: u32,
    pub dead_letter_exchange: String,
    /// Empty lets the broker pick one.
    pub consumer_tag: String,
}

impl SubscribeOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            prefetch: settings.consumer.prefetch_count,
            max_decode_attempts: settings.consumer.max_decode_attempts,
            dead_letter_exchange: settings.exchanges.dead_letter.clone(),
            consumer_tag: String::new(),
        }
    }
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

/// Outcome counts for one subscription's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub acked: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub decode_failures: u64,
    /// Verdicts the broker refused, e.g. after the channel went away.
    pub ack_failures: u64,
}

impl SubscriptionStats {
    fn record(&mut self, verdict: AckType) {
        match verdict {
            AckType::Ack => self.acked += 1,
            AckType::NackRequeue => self.requeued += 1,
            AckType::NackDiscard => self.discarded += 1,
        }
    }
}

/// Handle on a running subscription task.
#[derive(Debug)]
pub struct Subscription {
    queue: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<SubscriptionStats>,
}

impl Subscription {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// True once the task has exited, whether stopped or because its
    /// delivery stream closed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop after the envelope currently being handled (if any) is settled,
    /// close the channel, and return the final counts.
    pub async fn shutdown(self) -> SubscriptionStats {
        let Subscription { queue, stop, task } = self;
        let _ = stop.send(true);
        join_task(&queue, task).await
    }

    /// Wait for the task to end on its own, i.e. for the delivery stream to
    /// close.
    pub async fn join(self) -> SubscriptionStats {
        let Subscription { queue, stop, task } = self;
        let stats = join_task(&queue, task).await;
        drop(stop);
        stats
    }
}

async fn join_task(queue: &str, task: JoinHandle<SubscriptionStats>) -> SubscriptionStats {
    match task.await {
        Ok(stats) => stats,
        Err(e) => {
            error!("Subscription task for {queue} failed: {e}");
            SubscriptionStats::default()
        }
    }
}

/// Declare and bind `binding`, then consume it on a dedicated task, decoding
/// each body with `codec` and settling it with `handler`'s verdict.
pub async fn subscribe<C, K, T, H>(
    connection: &C,
    binding: &Binding,
    options: &SubscribeOptions,
    codec: K,
    handler: H,
) -> Result<Subscription>
where
    C: Connection,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let (channel, queue) =
        declare_and_bind(connection, binding, &options.dead_letter_exchange).await?;

    let deliveries = match start_consumer(&channel, &queue.name, options).await {
        Ok(deliveries) => deliveries,
        Err(e) => {
            let _ = channel.close().await;
            return Err(e);
        }
    };

    info!(
        "Subscribed to {} on {} ({}) with prefetch {}",
        queue.name, binding.exchange, binding.routing_key, options.prefetch
    );

    let (stop, stop_rx) = watch::channel(false);
    let failures = DecodeFailures::new(options.max_decode_attempts);
    let task = tokio::spawn(run::<_, K, T, H>(
        queue.name.clone(),
        channel,
        deliveries,
        codec,
        handler,
        stop_rx,
        failures,
    ));

    Ok(Subscription {
        queue: queue.name,
        stop,
        task,
    })
}

/// `subscribe` with the structured-text codec.
pub async fn subscribe_json<C, T, H>(
    connection: &C,
    binding: &Binding,
    options: &SubscribeOptions,
    handler: H,
) -> Result<Subscription>
where
    C: Connection,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    subscribe(connection, binding, options, JsonCodec, handler).await
}

/// `subscribe` with the binary codec.
pub async fn subscribe_binary<C, T, H>(
    connection: &C,
    binding: &Binding,
    options: &SubscribeOptions,
    handler: H,
) -> Result<Subscription>
where
    C: Connection,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    subscribe(connection, binding, options, BinaryCodec, handler).await
}

async fn start_consumer<Ch: Channel>(
    channel: &Ch,
    queue: &str,
    options: &SubscribeOptions,
) -> Result<Deliveries> {
    channel
        .set_prefetch(options.prefetch)
        .await
        .map_err(|source| PubSubError::Qos {
            prefetch: options.prefetch,
            source,
        })?;

    channel
        .consume(queue, &options.consumer_tag)
        .await
        .map_err(|source| PubSubError::Consume {
            queue: queue.to_string(),
            source,
        })
}

async fn run<Ch, K, T, H>(
    queue: String,
    channel: Ch,
    mut deliveries: Deliveries,
    codec: K,
    mut handler: H,
    mut stop: watch::Receiver<bool>,
    mut failures: DecodeFailures,
) -> SubscriptionStats
where
    Ch: Channel,
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let mut stats = SubscriptionStats::default();
    let mut stop_open = true;

    loop {
        tokio::select! {
            biased;

            changed = stop.changed(), if stop_open => match changed {
                Ok(()) if *stop.borrow() => {
                    info!("Stopping subscription on {queue}");
                    break;
                }
                Ok(()) => {}
                // handle dropped: keep consuming until the stream closes
                Err(_) => stop_open = false,
            },

            next = deliveries.next() => match next {
                Some(Ok(envelope)) => {
                    process::<K, T, H>(envelope, &codec, &mut handler, &mut failures, &mut stats)
                        .await;
                }
                Some(Err(e)) => {
                    warn!("Delivery stream for {queue} failed: {e}");
                    break;
                }
                None => {
                    info!("Delivery stream for {queue} closed");
                    break;
                }
            },
        }
    }

    if let Err(e) = channel.close().await {
        debug!("Closing channel for {queue}: {e}");
    }
    stats
}

async fn process<K, T, H>(
    envelope: Envelope,
    codec: &K,
    handler: &mut H,
    failures: &mut DecodeFailures,
    stats: &mut SubscriptionStats,
) where
    K: Codec,
    T: DeserializeOwned + Send + 'static,
    H: Handler<T>,
{
    let delivery_tag = envelope.delivery_tag();

    let verdict = match codec.decode::<T>(&envelope.body, envelope.content_type()) {
        Ok(message) => handler.handle(message, &envelope.info).await,
        Err(e) => {
            stats.decode_failures += 1;
            let verdict = failures.record(&envelope.info, &envelope.body);
            warn!(
                "Could not decode delivery {delivery_tag} ({}): {e}; {verdict}",
                envelope.info.routing_key
            );
            verdict
        }
    };

    let settled = verdict
        .apply(envelope)
        .await
        .map_err(|source| PubSubError::Ack {
            delivery_tag,
            source,
        });
    match settled {
        Ok(()) => {
            stats.record(verdict);
            debug!("Delivery {delivery_tag}: {verdict}");
        }
        Err(e) => {
            stats.ack_failures += 1;
            warn!("{e} ({verdict})");
        }
    }
}

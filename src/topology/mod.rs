//! Queue topology
//!
//! Declares a subscription's queue and binds it to an exchange. The queue's
//! flags are derived only from its `QueueDurability`, and every queue carries
//! a dead-letter exchange so that discarded or rejected messages are kept at
//! the broker instead of vanishing.
//!
//! Failures are returned, never fatal: the caller decides whether to retry,
//! skip the subscription, or abort.

use tracing::{debug, error};

use crate::config::ExchangeSettings;
use crate::transport::{Channel, Connection, ExchangeKind, QueueArguments, QueueFlags, QueueInfo};
use crate::utils::error::{PubSubError, Result};

/// Lifetime class of a subscription queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueDurability {
    /// Survives broker restarts, never auto-deleted, shareable between consumers.
    Durable,
    /// Exclusive to the declaring connection and deleted with it.
    Transient,
}

impl QueueDurability {
    pub const fn flags(self) -> QueueFlags {
        match self {
            QueueDurability::Durable => QueueFlags {
                durable: true,
                auto_delete: false,
                exclusive: false,
            },
            QueueDurability::Transient => QueueFlags {
                durable: false,
                auto_delete: true,
                exclusive: true,
            },
        }
    }
}

/// Where a subscription's queue lives and what it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub durability: QueueDurability,
}

impl Binding {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        durability: QueueDurability,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            durability,
        }
    }
}

/// Open a channel on `connection`, then declare and bind `binding`'s queue on it.
pub async fn declare_and_bind<C: Connection>(
    connection: &C,
    binding: &Binding,
    dead_letter_exchange: &str,
) -> Result<(C::Channel, QueueInfo)> {
    let channel = connection
        .open_channel()
        .await
        .map_err(PubSubError::Channel)?;
    let queue = declare_and_bind_on(&channel, binding, dead_letter_exchange).await?;
    Ok((channel, queue))
}

/// Declare `binding.queue` with flags from its durability class and the
/// dead-letter argument, then bind it to `binding.exchange`.
pub async fn declare_and_bind_on<Ch: Channel>(
    channel: &Ch,
    binding: &Binding,
    dead_letter_exchange: &str,
) -> Result<QueueInfo> {
    let arguments = QueueArguments {
        dead_letter_exchange: Some(dead_letter_exchange.to_string()),
    };

    let queue = channel
        .declare_queue(&binding.queue, binding.durability.flags(), &arguments)
        .await
        .map_err(|source| {
            error!("Could not declare queue {}: {source}", binding.queue);
            PubSubError::DeclareQueue {
                queue: binding.queue.clone(),
                source,
            }
        })?;

    channel
        .bind_queue(&queue.name, &binding.exchange, &binding.routing_key)
        .await
        .map_err(|source| {
            error!(
                "Could not bind queue {} to {} ({}): {source}",
                queue.name, binding.exchange, binding.routing_key
            );
            PubSubError::Bind {
                queue: queue.name.clone(),
                exchange: binding.exchange.clone(),
                routing_key: binding.routing_key.clone(),
                source,
            }
        })?;

    debug!(
        "Declared {:?} queue {} bound to {} with {}",
        binding.durability, queue.name, binding.exchange, binding.routing_key
    );
    Ok(queue)
}

/// Declare the exchange set: direct and topic exchanges, the fanout
/// dead-letter exchange, and a durable queue collecting dead letters.
///
/// The dead-letter queue is the one queue declared without a dead-letter
/// argument. Pointing it at its own exchange would route anything rejected
/// from it straight back into it.
pub async fn declare_exchanges<Ch: Channel>(
    channel: &Ch,
    exchanges: &ExchangeSettings,
) -> Result<()> {
    let declarations = [
        (&exchanges.direct, ExchangeKind::Direct),
        (&exchanges.topic, ExchangeKind::Topic),
        (&exchanges.dead_letter, ExchangeKind::Fanout),
    ];
    for (name, kind) in declarations {
        channel
            .declare_exchange(name, kind, true)
            .await
            .map_err(|source| PubSubError::DeclareExchange {
                exchange: name.clone(),
                source,
            })?;
    }

    let dead_letters = channel
        .declare_queue(
            &exchanges.dead_letter_queue,
            QueueDurability::Durable.flags(),
            &QueueArguments::default(),
        )
        .await
        .map_err(|source| PubSubError::DeclareQueue {
            queue: exchanges.dead_letter_queue.clone(),
            source,
        })?;

    channel
        .bind_queue(&dead_letters.name, &exchanges.dead_letter, "")
        .await
        .map_err(|source| PubSubError::Bind {
            queue: dead_letters.name.clone(),
            exchange: exchanges.dead_letter.clone(),
            routing_key: String::new(),
            source,
        })?;

    Ok(())
}

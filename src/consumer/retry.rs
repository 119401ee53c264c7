//! Bounded requeue for undecodable deliveries.
//!
//! A body that fails to decode once will fail every time, so requeueing it
//! forever just spins. Each failure is counted per message and the delivery
//! is requeued until it reaches `max_attempts`, then discarded to the
//! dead-letter exchange.
//!
//! The count comes from the broker (`delivery_count`) when it tracks one, and
//! from a local table otherwise, keyed by message id or, failing that, by
//! routing key and body hash.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::ack::AckType;
use crate::transport::DeliveryInfo;

/// Local table size at which it is reset.
const MAX_TRACKED: usize = 1024;

#[derive(Debug)]
pub(crate) struct DecodeFailures {
    max_attempts: u32,
    attempts: HashMap<String, u32>,
}

impl DecodeFailures {
    pub(crate) fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: HashMap::new(),
        }
    }

    /// Count one failed decode and pick the verdict for it.
    pub(crate) fn record(&mut self, info: &DeliveryInfo, body: &[u8]) -> AckType {
        let key = fingerprint(info, body);
        if !self.attempts.contains_key(&key) && self.attempts.len() >= MAX_TRACKED {
            self.attempts.clear();
        }

        let local = self.attempts.entry(key.clone()).or_insert(0);
        *local += 1;
        let attempts = match info.delivery_count {
            Some(prior) => (*local).max(prior.saturating_add(1)),
            None => *local,
        };

        if attempts >= self.max_attempts {
            self.attempts.remove(&key);
            AckType::NackDiscard
        } else {
            AckType::NackRequeue
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.attempts.len()
    }
}

fn fingerprint(info: &DeliveryInfo, body: &[u8]) -> String {
    if let Some(id) = &info.message_id {
        return format!("id:{id}");
    }
    let mut hasher = DefaultHasher::new();
    info.routing_key.hash(&mut hasher);
    body.hash(&mut hasher);
    format!("hash:{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(message_id: Option<&str>, delivery_count: Option<u32>) -> DeliveryInfo {
        DeliveryInfo {
            exchange: "peril_topic".to_string(),
            routing_key: "army_moves.bob".to_string(),
            content_type: None,
            message_id: message_id.map(str::to_string),
            timestamp: None,
            delivery_tag: 1,
            redelivered: false,
            delivery_count,
        }
    }

    #[test]
    fn requeues_until_bound_then_discards() {
        let mut failures = DecodeFailures::new(3);
        let info = info(Some("m1"), None);
        assert_eq!(failures.record(&info, b"x"), AckType::NackRequeue);
        assert_eq!(failures.record(&info, b"x"), AckType::NackRequeue);
        assert_eq!(failures.record(&info, b"x"), AckType::NackDiscard);
        assert_eq!(failures.tracked(), 0);
    }

    #[test]
    fn broker_delivery_count_wins_over_local_count() {
        let mut failures = DecodeFailures::new(3);
        // Already delivered twice before this consumer saw it.
        assert_eq!(
            failures.record(&info(Some("m1"), Some(2)), b"x"),
            AckType::NackDiscard
        );
    }

    #[test]
    fn messages_without_id_are_keyed_by_body() {
        let mut failures = DecodeFailures::new(2);
        let anonymous = info(None, None);
        assert_eq!(failures.record(&anonymous, b"a"), AckType::NackRequeue);
        assert_eq!(failures.record(&anonymous, b"b"), AckType::NackRequeue);
        assert_eq!(failures.record(&anonymous, b"a"), AckType::NackDiscard);
        assert_eq!(failures.tracked(), 1);
    }

    #[test]
    fn zero_bound_is_treated_as_one() {
        let mut failures = DecodeFailures::new(0);
        assert_eq!(
            failures.record(&info(Some("m1"), None), b"x"),
            AckType::NackDiscard
        );
    }
}

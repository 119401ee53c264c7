//! Acknowledgement verdicts
//!
//! A handler's answer for one delivery. `apply` is the only place a verdict is
//! turned into broker calls, and every arm settles exactly the one envelope it
//! is given.

use std::fmt;

use crate::transport::Envelope;
use crate::utils::error::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckType {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed now; put back for another delivery.
    NackRequeue,
    /// Never processable; drop to the dead-letter exchange.
    NackDiscard,
}

impl AckType {
    pub async fn apply(self, envelope: Envelope) -> Result<(), BrokerError> {
        match self {
            AckType::Ack => envelope.ack().await,
            AckType::NackRequeue => envelope.nack(true).await,
            AckType::NackDiscard => envelope.nack(false).await,
        }
    }
}

impl fmt::Display for AckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AckType::Ack => "ack",
            AckType::NackRequeue => "nack_requeue",
            AckType::NackDiscard => "nack_discard",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::AckType;
    use crate::transport::{Acker, DeliveryInfo, Envelope};
    use crate::utils::error::BrokerError;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Ack,
        Nack { requeue: bool },
    }

    #[derive(Default)]
    struct RecordingAcker {
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait]
    impl Acker for RecordingAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.calls.lock().unwrap().push(Call::Ack);
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
            self.calls.lock().unwrap().push(Call::Nack { requeue });
            Ok(())
        }
    }

    fn envelope(acker: Arc<RecordingAcker>) -> Envelope {
        let info = DeliveryInfo {
            exchange: "peril_topic".to_string(),
            routing_key: "game_logs.bob".to_string(),
            content_type: None,
            message_id: None,
            timestamp: None,
            delivery_tag: 7,
            redelivered: false,
            delivery_count: None,
        };
        Envelope::new(info, Vec::new(), acker)
    }

    async fn calls_for(verdict: AckType) -> Vec<Call> {
        let acker = Arc::new(RecordingAcker::default());
        verdict.apply(envelope(acker.clone())).await.unwrap();
        let calls = acker.calls.lock().unwrap().clone();
        calls
    }

    #[tokio::test]
    async fn each_verdict_issues_exactly_one_call() {
        assert_eq!(calls_for(AckType::Ack).await, vec![Call::Ack]);
        assert_eq!(
            calls_for(AckType::NackRequeue).await,
            vec![Call::Nack { requeue: true }]
        );
        assert_eq!(
            calls_for(AckType::NackDiscard).await,
            vec![Call::Nack { requeue: false }]
        );
    }

    #[test]
    fn display_names() {
        assert_eq!(AckType::Ack.to_string(), "ack");
        assert_eq!(AckType::NackRequeue.to_string(), "nack_requeue");
        assert_eq!(AckType::NackDiscard.to_string(), "nack_discard");
    }
}

use futures::StreamExt;

use super::{Broker, MemoryBroker};
use super::topic::{routes_to, topic_matches};
use crate::transport::{
    Channel, Connection, ExchangeKind, OutboundMessage, QueueArguments, QueueFlags,
};
use crate::utils::error::BrokerError;

const DURABLE: QueueFlags = QueueFlags {
    durable: true,
    auto_delete: false,
    exclusive: false,
};

const TRANSIENT: QueueFlags = QueueFlags {
    durable: false,
    auto_delete: true,
    exclusive: true,
};

fn message(body: &str) -> OutboundMessage {
    OutboundMessage {
        content_type: "text/plain".to_string(),
        message_id: format!("id-{body}"),
        timestamp: 0,
        body: body.as_bytes().to_vec(),
    }
}

fn dlx_args() -> QueueArguments {
    QueueArguments {
        dead_letter_exchange: Some("dlx".to_string()),
    }
}

#[test]
fn test_topic_wildcards() {
    assert!(topic_matches("game_logs.*", "game_logs.bob"));
    assert!(!topic_matches("game_logs.*", "game_logs"));
    assert!(!topic_matches("game_logs.*", "game_logs.bob.extra"));
    assert!(topic_matches("game_logs.#", "game_logs"));
    assert!(topic_matches("game_logs.#", "game_logs.bob.extra"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(topic_matches("*.bob", "war.bob"));
    assert!(!topic_matches("army_moves.*", "war.bob"));
}

#[test]
fn test_exchange_kinds() {
    assert!(routes_to(ExchangeKind::Direct, "pause", "pause"));
    assert!(!routes_to(ExchangeKind::Direct, "pause.*", "pause.bob"));
    assert!(routes_to(ExchangeKind::Topic, "pause.*", "pause.bob"));
    assert!(routes_to(ExchangeKind::Fanout, "", "whatever"));
}

#[tokio::test]
async fn test_publish_routes_to_bound_queue() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let ch = conn.open_channel().await.unwrap();

    ch.declare_exchange("topic", ExchangeKind::Topic, true)
        .await
        .unwrap();
    ch.declare_queue("logs", DURABLE, &QueueArguments::default())
        .await
        .unwrap();
    ch.bind_queue("logs", "topic", "game_logs.*").await.unwrap();

    ch.publish("topic", "game_logs.bob", message("a"))
        .await
        .unwrap();
    ch.publish("topic", "army_moves.bob", message("b"))
        .await
        .unwrap();

    let ready = broker.inspect(|b| b.peek("logs"));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].body, b"a");
    assert_eq!(ready[0].routing_key, "game_logs.bob");
}

#[tokio::test]
async fn test_publish_to_unknown_exchange_fails() {
    let broker = MemoryBroker::new();
    let ch = broker.connect().open_channel().await.unwrap();

    let err = ch.publish("missing", "key", message("a")).await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn test_redeclare_with_other_flags_fails() {
    let broker = MemoryBroker::new();
    let ch = broker.connect().open_channel().await.unwrap();

    ch.declare_queue("q", DURABLE, &dlx_args()).await.unwrap();
    // identical redeclare is fine
    ch.declare_queue("q", DURABLE, &dlx_args()).await.unwrap();

    let err = ch
        .declare_queue(
            "q",
            QueueFlags {
                durable: false,
                ..DURABLE
            },
            &dlx_args(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PreconditionFailed(_)));

    let err = ch
        .declare_queue("q", DURABLE, &QueueArguments::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_exclusive_queue_is_locked_to_its_connection() {
    let broker = MemoryBroker::new();
    let owner = broker.connect();
    let other = broker.connect();
    let owner_ch = owner.open_channel().await.unwrap();
    let other_ch = other.open_channel().await.unwrap();

    owner_ch
        .declare_queue("pause.bob", TRANSIENT, &dlx_args())
        .await
        .unwrap();

    let locked = other_ch.consume("pause.bob", "").await;
    assert!(matches!(locked, Err(BrokerError::ResourceLocked(_))));

    owner.close().await.unwrap();
    assert!(!broker.inspect(|b| b.queue_exists("pause.bob")));
}

#[tokio::test]
async fn test_bind_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let ch = broker.connect().open_channel().await.unwrap();
    ch.declare_queue("q", DURABLE, &QueueArguments::default())
        .await
        .unwrap();

    let err = ch.bind_queue("q", "nope", "k").await.unwrap_err();
    assert!(matches!(err, BrokerError::NotFound(_)));
}

#[tokio::test]
async fn test_prefetch_limits_unacked_deliveries() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let ch = conn.open_channel().await.unwrap();
    ch.declare_queue("q", DURABLE, &QueueArguments::default())
        .await
        .unwrap();
    for i in 0..5 {
        ch.publish("", "q", message(&i.to_string())).await.unwrap();
    }

    ch.set_prefetch(2).await.unwrap();
    let mut deliveries = ch.consume("q", "c1").await.unwrap();

    assert_eq!(broker.inspect(|b| b.unacked_count("q")), 2);
    assert_eq!(broker.inspect(|b| b.ready_count("q")), 3);

    let first = deliveries.next().await.unwrap().unwrap();
    assert_eq!(first.body, b"0");
    first.ack().await.unwrap();

    assert_eq!(broker.inspect(|b| b.unacked_count("q")), 2);
    assert_eq!(broker.inspect(|b| b.ready_count("q")), 2);
}

#[tokio::test]
async fn test_nack_requeue_marks_redelivered() {
    let broker = MemoryBroker::new();
    let ch = broker.connect().open_channel().await.unwrap();
    ch.declare_queue("q", DURABLE, &QueueArguments::default())
        .await
        .unwrap();
    ch.publish("", "q", message("again")).await.unwrap();

    let mut deliveries = ch.consume("q", "").await.unwrap();
    let first = deliveries.next().await.unwrap().unwrap();
    assert!(!first.redelivered());
    assert_eq!(first.info.delivery_count, Some(0));
    first.nack(true).await.unwrap();

    let second = deliveries.next().await.unwrap().unwrap();
    assert_eq!(second.body, b"again");
    assert!(second.redelivered());
    assert_eq!(second.info.delivery_count, Some(1));
    second.ack().await.unwrap();

    assert_eq!(broker.inspect(|b| b.ready_count("q")), 0);
    assert_eq!(broker.inspect(|b| b.unacked_count("q")), 0);
}

#[tokio::test]
async fn test_nack_discard_dead_letters() {
    let broker = MemoryBroker::new();
    let ch = broker.connect().open_channel().await.unwrap();
    ch.declare_exchange("dlx", ExchangeKind::Fanout, true)
        .await
        .unwrap();
    ch.declare_queue("dlq", DURABLE, &QueueArguments::default())
        .await
        .unwrap();
    ch.bind_queue("dlq", "dlx", "").await.unwrap();
    ch.declare_queue("q", DURABLE, &dlx_args()).await.unwrap();
    ch.publish("", "q", message("poison")).await.unwrap();

    let mut deliveries = ch.consume("q", "").await.unwrap();
    let envelope = deliveries.next().await.unwrap().unwrap();
    envelope.nack(false).await.unwrap();

    assert_eq!(broker.inspect(|b| b.ready_count("q")), 0);
    let dead = broker.inspect(|b| b.peek("dlq"));
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, b"poison");
    assert_eq!(dead[0].death_count, 1);
}

#[test]
fn test_second_ack_for_same_tag_is_rejected() {
    let shared = Broker::shared();
    let mut engine = shared.lock().unwrap();
    let conn = engine.open_connection();
    let ch = engine.open_channel(conn).unwrap();
    engine
        .declare_queue(ch, "q", DURABLE, &QueueArguments::default())
        .unwrap();
    engine.publish(ch, "", "q", message("once")).unwrap();

    let (tag, mut receiver) = engine.consume(ch, "q", "c").unwrap();
    let envelope = futures::executor::block_on(receiver.next()).unwrap().unwrap();
    let delivery_tag = envelope.delivery_tag();

    engine.ack(&tag, delivery_tag).unwrap();
    let err = engine.ack(&tag, delivery_tag).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownDeliveryTag(t) if t == delivery_tag));
    let err = engine.nack(&tag, delivery_tag, true).unwrap_err();
    assert!(matches!(err, BrokerError::UnknownDeliveryTag(_)));
}

#[tokio::test]
async fn test_channel_close_requeues_in_order_and_ends_stream() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let ch = conn.open_channel().await.unwrap();
    ch.declare_queue("q", DURABLE, &QueueArguments::default())
        .await
        .unwrap();
    for body in ["a", "b", "c"] {
        ch.publish("", "q", message(body)).await.unwrap();
    }

    let consumer_ch = conn.open_channel().await.unwrap();
    let mut deliveries = consumer_ch.consume("q", "").await.unwrap();
    assert_eq!(broker.inspect(|b| b.unacked_count("q")), 3);

    consumer_ch.close().await.unwrap();

    let ready = broker.inspect(|b| b.peek("q"));
    let bodies: Vec<&[u8]> = ready.iter().map(|m| m.body.as_slice()).collect();
    assert_eq!(bodies, vec![b"a".as_slice(), b"b", b"c"]);
    assert!(ready.iter().all(|m| m.redelivered));

    // buffered envelopes drain, then the stream ends
    let mut remaining = 0;
    while let Some(item) = deliveries.next().await {
        assert!(item.is_ok());
        remaining += 1;
    }
    assert_eq!(remaining, 3);
}

#[tokio::test]
async fn test_auto_delete_queue_removed_with_last_consumer() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let ch = conn.open_channel().await.unwrap();
    ch.declare_queue("temp", TRANSIENT, &QueueArguments::default())
        .await
        .unwrap();
    let _deliveries = ch.consume("temp", "").await.unwrap();
    assert_eq!(broker.inspect(|b| b.consumer_count("temp")), 1);

    ch.close().await.unwrap();
    assert!(!broker.inspect(|b| b.queue_exists("temp")));
}

#[tokio::test]
async fn test_round_robin_between_consumers() {
    let broker = MemoryBroker::new();
    let conn = broker.connect();
    let ch = conn.open_channel().await.unwrap();
    ch.declare_queue("work", DURABLE, &QueueArguments::default())
        .await
        .unwrap();

    let mut first = ch.consume("work", "one").await.unwrap();
    let mut second = ch.consume("work", "two").await.unwrap();
    for body in ["a", "b"] {
        ch.publish("", "work", message(body)).await.unwrap();
    }

    let a = first.next().await.unwrap().unwrap();
    let b = second.next().await.unwrap().unwrap();
    assert_eq!(a.body, b"a");
    assert_eq!(b.body, b"b");
}

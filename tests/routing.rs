// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use exchange_connector::{
    config::Configs,
    events::{publish_event, EventCategory, EventLevel},
    exchange::ExchangeDefinition,
    log_consumer,
    memory::{MemoryBroker, GENERATED_QUEUE_PREFIX},
    queue::QueueBinding,
    AmqpError, ExchangeConnector,
};
use std::sync::Arc;

fn connector(broker: &MemoryBroker, exchange: ExchangeDefinition) -> ExchangeConnector {
    ExchangeConnector::with_broker(Configs::default(), exchange, Arc::new(broker.clone()))
}

#[tokio::test]
async fn identical_exchange_redeclaration_changes_nothing() {
    let broker = MemoryBroker::new();
    let connector = connector(&broker, log_consumer::exchange());

    connector.enter().await.unwrap().exit().await.unwrap();
    connector.enter().await.unwrap().exit().await.unwrap();

    assert_eq!(
        broker.exchange(log_consumer::PRODUCER_LOG_EXCHANGE),
        Some(log_consumer::exchange())
    );
    assert_eq!(broker.connections_opened(), 2);
}

#[tokio::test]
async fn conflicting_exchange_redeclaration_is_reported() {
    let broker = MemoryBroker::new();
    connector(&broker, log_consumer::exchange())
        .enter()
        .await
        .unwrap()
        .exit()
        .await
        .unwrap();

    let res = connector(
        &broker,
        ExchangeDefinition::new(log_consumer::PRODUCER_LOG_EXCHANGE).direct(),
    )
    .enter()
    .await;

    assert!(matches!(
        res,
        Err(AmqpError::ExchangeConflictError(name)) if name == "producer_log"
    ));
}

#[tokio::test]
async fn user_error_reaches_user_queues_only() {
    let broker = MemoryBroker::new();
    let session = connector(&broker, log_consumer::exchange())
        .enter()
        .await
        .unwrap();

    let names = log_consumer::install(&session).await.unwrap();
    assert_eq!(names, vec!["user.info", "user.error", "order.info", "order.error"]);

    publish_event(
        &session.publisher(),
        EventCategory::User,
        EventLevel::Error,
        "invalid password",
    )
    .await
    .unwrap();

    assert_eq!(broker.queue_depth("user.info"), Some(1));
    assert_eq!(broker.queue_depth("user.error"), Some(1));
    assert_eq!(broker.queue_depth("order.info"), Some(0));
    assert_eq!(broker.queue_depth("order.error"), Some(0));

    session.exit().await.unwrap();
}

#[tokio::test]
async fn star_matches_one_word_and_hash_any_number() {
    let broker = MemoryBroker::new();
    let session = connector(&broker, ExchangeDefinition::new("events").topic())
        .enter()
        .await
        .unwrap();

    for (queue, key) in [
        ("one", "order.*"),
        ("many", "order.#"),
        ("all", "#"),
        ("infos", "*.info"),
    ] {
        session.declare_queue(queue, Some(key)).await.unwrap();
    }

    session.publish(b"x", "order.info.extra").await.unwrap();
    assert_eq!(broker.queue_depth("one"), Some(0));
    assert_eq!(broker.queue_depth("many"), Some(1));
    assert_eq!(broker.queue_depth("all"), Some(1));
    assert_eq!(broker.queue_depth("infos"), Some(0));

    session.publish(b"x", "order").await.unwrap();
    assert_eq!(broker.queue_depth("one"), Some(0));
    assert_eq!(broker.queue_depth("many"), Some(2));

    session.publish(b"x", "order.info").await.unwrap();
    assert_eq!(broker.queue_depth("one"), Some(1));
    assert_eq!(broker.queue_depth("many"), Some(3));
    assert_eq!(broker.queue_depth("all"), Some(3));
    assert_eq!(broker.queue_depth("infos"), Some(1));

    session.exit().await.unwrap();
}

#[tokio::test]
async fn overlapping_bindings_deliver_one_copy() {
    let broker = MemoryBroker::new();
    let session = connector(&broker, ExchangeDefinition::new("events").topic())
        .enter()
        .await
        .unwrap();

    session.declare_queue("audit", Some("user.*")).await.unwrap();
    session.declare_queue("audit", Some("#")).await.unwrap();
    assert_eq!(broker.bindings("audit").len(), 2);

    session.publish(b"x", "user.info").await.unwrap();
    assert_eq!(broker.queue_depth("audit"), Some(1));

    session.exit().await.unwrap();
}

#[tokio::test]
async fn generated_queue_names_are_unique_and_routable() {
    let broker = MemoryBroker::new();
    let session = connector(&broker, ExchangeDefinition::new("jobs").direct())
        .enter()
        .await
        .unwrap();

    let first = session.declare_queue("", None).await.unwrap();
    let second = session.declare_queue("", None).await.unwrap();

    assert!(first.starts_with(GENERATED_QUEUE_PREFIX));
    assert!(first.len() > GENERATED_QUEUE_PREFIX.len());
    assert_ne!(first, second);
    assert_eq!(
        broker.bindings(&first),
        vec![QueueBinding::new(&first, "jobs", &first)]
    );

    session.publish(b"job", &first).await.unwrap();
    assert_eq!(broker.queue_depth(&first), Some(1));
    assert_eq!(broker.queue_depth(&second), Some(0));

    session.exit().await.unwrap();
}

#[tokio::test]
async fn unmatched_routing_keys_are_dropped_silently() {
    let broker = MemoryBroker::new();
    let session = connector(&broker, log_consumer::exchange())
        .enter()
        .await
        .unwrap();
    log_consumer::install(&session).await.unwrap();

    assert_eq!(session.publish(b"x", "payment.info").await, Ok(()));
    assert_eq!(session.publish(b"x", "").await, Ok(()));
    for queue in log_consumer::LOG_QUEUES {
        assert_eq!(broker.queue_depth(queue.name), Some(0));
    }

    session.exit().await.unwrap();
}

#[tokio::test]
async fn fanout_ignores_the_routing_key() {
    let broker = MemoryBroker::new();
    let session = connector(&broker, ExchangeDefinition::new("broadcast").fanout())
        .enter()
        .await
        .unwrap();

    session.declare_queue("a", Some("whatever")).await.unwrap();
    session.declare_queue("b", None).await.unwrap();
    session.publish(b"x", "anything.at.all").await.unwrap();

    assert_eq!(broker.queue_depth("a"), Some(1));
    assert_eq!(broker.queue_depth("b"), Some(1));

    session.exit().await.unwrap();
}

#[tokio::test]
async fn durable_declarations_survive_a_restart() {
    let broker = MemoryBroker::new();
    let connector = connector(&broker, log_consumer::exchange());

    let session = connector.enter().await.unwrap();
    log_consumer::install(&session).await.unwrap();
    session.publish(b"hello", "order.info").await.unwrap();
    session.exit().await.unwrap();

    broker.restart();

    assert_eq!(
        broker.exchange(log_consumer::PRODUCER_LOG_EXCHANGE),
        Some(log_consumer::exchange())
    );
    assert_eq!(broker.queue_depth("order.info"), Some(1));
    assert_eq!(broker.bindings("order.info").len(), 1);
}

#[tokio::test]
async fn restart_kills_open_sessions() {
    let broker = MemoryBroker::new();
    let session = connector(&broker, log_consumer::exchange())
        .enter()
        .await
        .unwrap();

    broker.restart();

    assert_eq!(
        session.publish(b"x", "user.info").await,
        Err(AmqpError::ChannelError)
    );
    assert_eq!(session.exit().await, Err(AmqpError::ChannelError));
}

#[tokio::test(start_paused = true)]
async fn enter_retries_until_the_broker_accepts() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(3);

    let session = connector(&broker, log_consumer::exchange())
        .enter()
        .await
        .unwrap();
    assert_eq!(broker.connections_opened(), 1);

    session.exit().await.unwrap();
}

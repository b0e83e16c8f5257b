// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use async_trait::async_trait;
use exchange_connector::{
    broker::Delivery,
    config::Configs,
    dispatcher::{Dispatcher, DispatcherDefinition, StopHandle},
    events::{publish_event, EventCategory, EventLevel},
    exchange::ExchangeDefinition,
    handler::{ConsumerHandler, FnHandler},
    log_consumer::{self, LogLevel, LogSink},
    memory::MemoryBroker,
    AmqpError, ExchangeConnector, HandlerError,
};
use opentelemetry::Context;
use std::{
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::timeout;

type Lines = Arc<Mutex<Vec<(LogLevel, String)>>>;

/// Records log lines and stops consumption once `expected` lines arrived.
struct Recorder {
    lines: Lines,
    expected: usize,
    stop: StopHandle,
}

impl LogSink for Recorder {
    fn write(&self, level: LogLevel, line: &str) {
        let mut lines = self.lines.lock().unwrap();
        lines.push((level, line.to_owned()));
        if lines.len() >= self.expected {
            self.stop.stop();
        }
    }
}

fn connector(broker: &MemoryBroker, exchange: ExchangeDefinition) -> ExchangeConnector {
    ExchangeConnector::with_broker(Configs::default(), exchange, Arc::new(broker.clone()))
}

async fn bounded<T>(fut: impl Future<Output = T>) -> T {
    timeout(Duration::from_secs(5), fut)
        .await
        .expect("consumer did not stop in time")
}

#[tokio::test]
async fn user_info_hello_is_logged_once_at_info() {
    let broker = MemoryBroker::new();
    let lines = Lines::default();

    let recorded = lines.clone();
    let res = bounded(
        connector(&broker, log_consumer::exchange()).scope(move |session| {
            Box::pin(async move {
                let names = log_consumer::install(session).await?;
                session.publish(b"hello", "user.info").await?;

                let sink = Arc::new(Recorder {
                    lines: recorded,
                    expected: 1,
                    stop: session.stop_handle(),
                });
                log_consumer::register(session.dispatcher(), &names, sink)
                    .consume_blocking()
                    .await
            })
        }),
    )
    .await;

    assert_eq!(res, Ok(()));
    assert_eq!(
        *lines.lock().unwrap(),
        vec![(LogLevel::Info, "user_info: hello".to_owned())]
    );
    assert_eq!(broker.queue_depth("user.info"), Some(0));
    assert_eq!(broker.consumer_count("user.info"), Some(0));
}

#[tokio::test]
async fn order_error_is_logged_by_both_order_queues() {
    let broker = MemoryBroker::new();

    let producer = connector(&broker, log_consumer::exchange());
    let session = producer.enter().await.unwrap();
    log_consumer::install(&session).await.unwrap();
    publish_event(
        &session.publisher(),
        EventCategory::Order,
        EventLevel::Error,
        "payment declined",
    )
    .await
    .unwrap();
    session.exit().await.unwrap();

    assert_eq!(broker.queue_depth("user.info"), Some(0));
    assert_eq!(broker.queue_depth("user.error"), Some(0));

    let lines = Lines::default();
    let recorded = lines.clone();
    let res = bounded(
        connector(&broker, log_consumer::exchange()).scope(move |session| {
            let sink = Arc::new(Recorder {
                lines: recorded,
                expected: 2,
                stop: session.stop_handle(),
            });
            Box::pin(async move { log_consumer::run(session, sink).await })
        }),
    )
    .await;
    assert_eq!(res, Ok(()));

    let mut lines = lines.lock().unwrap().clone();
    lines.sort_by(|a, b| a.1.cmp(&b.1));
    assert_eq!(
        lines,
        vec![
            (LogLevel::Error, "order_error: payment declined".to_owned()),
            (LogLevel::Info, "order_info: payment declined".to_owned()),
        ]
    );
}

#[tokio::test]
async fn last_registered_handler_wins() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let seen = calls.clone();
    let res = bounded(
        connector(&broker, ExchangeDefinition::new("jobs").direct()).scope(move |session| {
            Box::pin(async move {
                let queue = session.declare_queue("", None).await?;
                session.publish(b"job", &queue).await?;

                let first = seen.clone();
                let second = seen.clone();
                let stop = session.stop_handle();

                session
                    .dispatcher()
                    .register(
                        &DispatcherDefinition::new(&queue),
                        Arc::new(FnHandler::new(move |_: &Delivery| {
                            first.lock().unwrap().push("first");
                            Ok(())
                        })),
                    )
                    .register(
                        &DispatcherDefinition::new(&queue),
                        Arc::new(FnHandler::new(move |_: &Delivery| {
                            second.lock().unwrap().push("second");
                            stop.stop();
                            Ok(())
                        })),
                    )
                    .consume_blocking()
                    .await
            })
        }),
    )
    .await;

    assert_eq!(res, Ok(()));
    assert_eq!(*calls.lock().unwrap(), vec!["second"]);
}

#[tokio::test]
async fn handler_error_stops_consumption_and_cancels_consumers() {
    let broker = MemoryBroker::new();

    let res = bounded(
        connector(&broker, ExchangeDefinition::new("jobs").direct()).scope(|session| {
            Box::pin(async move {
                session.declare_queue("jobs", None).await?;
                session.publish(b"first", "jobs").await?;
                session.publish(b"second", "jobs").await?;

                session
                    .dispatcher()
                    .register(
                        &DispatcherDefinition::new("jobs"),
                        Arc::new(FnHandler::new(|_: &Delivery| {
                            Err(HandlerError::new("cannot process"))
                        })),
                    )
                    .consume_blocking()
                    .await
            })
        }),
    )
    .await;

    assert_eq!(
        res,
        Err(AmqpError::HandlerError {
            queue: "jobs".to_owned(),
            reason: "cannot process".to_owned(),
        })
    );
    assert_eq!(broker.consumer_count("jobs"), Some(0));
}

/// Leaves deliveries with body `keep` unsettled, acks everything else.
struct Settling {
    seen: Mutex<Vec<(Vec<u8>, bool)>>,
    stop_after: usize,
    stop: StopHandle,
}

#[async_trait]
impl ConsumerHandler for Settling {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        if delivery.data != b"keep" {
            delivery.ack().await?;
        }

        let mut seen = self.seen.lock().unwrap();
        seen.push((delivery.data.clone(), delivery.redelivered));
        if seen.len() >= self.stop_after {
            self.stop.stop();
        }
        Ok(())
    }
}

#[tokio::test]
async fn unsettled_manual_deliveries_are_requeued_on_exit() {
    let broker = MemoryBroker::new();
    let jobs = || connector(&broker, ExchangeDefinition::new("jobs").direct());

    let inspect = broker.clone();
    let res = bounded(jobs().scope(move |session| {
        Box::pin(async move {
            session.declare_queue("jobs", None).await?;
            session.publish(b"keep", "jobs").await?;
            session.publish(b"done", "jobs").await?;

            let handler = Arc::new(Settling {
                seen: Mutex::new(Vec::new()),
                stop_after: 2,
                stop: session.stop_handle(),
            });
            session
                .dispatcher()
                .register(&DispatcherDefinition::new("jobs").manual_ack(), handler)
                .consume_blocking()
                .await?;

            assert_eq!(inspect.unacked_count("jobs"), Some(1));
            Ok(())
        })
    }))
    .await;

    assert_eq!(res, Ok(()));
    assert_eq!(broker.unacked_count("jobs"), Some(0));
    assert_eq!(broker.queue_depth("jobs"), Some(1));

    let redelivered = Arc::new(Mutex::new(None));
    let record = redelivered.clone();
    let res = bounded(jobs().scope(move |session| {
        Box::pin(async move {
            let stop = session.stop_handle();
            session
                .dispatcher()
                .register(
                    &DispatcherDefinition::new("jobs"),
                    Arc::new(FnHandler::new(move |d: &Delivery| {
                        *record.lock().unwrap() = Some((d.data.clone(), d.redelivered));
                        stop.stop();
                        Ok(())
                    })),
                )
                .consume_blocking()
                .await
        })
    }))
    .await;

    assert_eq!(res, Ok(()));
    assert_eq!(*redelivered.lock().unwrap(), Some((b"keep".to_vec(), true)));
    assert_eq!(broker.queue_depth("jobs"), Some(0));
}

/// Requeues the first delivery it sees, acks the redelivery.
struct RetryOnce {
    seen: Mutex<Vec<bool>>,
    stop: StopHandle,
}

#[async_trait]
impl ConsumerHandler for RetryOnce {
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        if delivery.redelivered {
            delivery.ack().await?;
            self.stop.stop();
        } else {
            delivery.nack(true).await?;
        }

        self.seen.lock().unwrap().push(delivery.redelivered);
        Ok(())
    }
}

#[tokio::test]
async fn nack_with_requeue_redelivers() {
    let broker = MemoryBroker::new();
    let handler_seen = Arc::new(Mutex::new(Vec::new()));

    let seen = handler_seen.clone();
    let res = bounded(
        connector(&broker, ExchangeDefinition::new("jobs").direct()).scope(move |session| {
            Box::pin(async move {
                session.declare_queue("jobs", None).await?;
                session.publish(b"flaky", "jobs").await?;

                let handler = Arc::new(RetryOnce {
                    seen: Mutex::new(Vec::new()),
                    stop: session.stop_handle(),
                });
                session
                    .dispatcher()
                    .register(&DispatcherDefinition::new("jobs").manual_ack(), handler.clone())
                    .consume_blocking()
                    .await?;

                seen.lock()
                    .unwrap()
                    .extend(handler.seen.lock().unwrap().iter().copied());
                Ok(())
            })
        }),
    )
    .await;

    assert_eq!(res, Ok(()));
    assert_eq!(*handler_seen.lock().unwrap(), vec![false, true]);
    assert_eq!(broker.queue_depth("jobs"), Some(0));
    assert_eq!(broker.unacked_count("jobs"), Some(0));
}

#[tokio::test]
async fn stop_from_another_task_ends_an_idle_loop() {
    let broker = MemoryBroker::new();

    let res = bounded(
        connector(&broker, log_consumer::exchange()).scope(|session| {
            let stop = session.stop_handle();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                stop.stop();
                stop.stop();
            });

            Box::pin(async move {
                log_consumer::run(session, Arc::new(log_consumer::TracingSink)).await
            })
        }),
    )
    .await;

    assert_eq!(res, Ok(()));
    for queue in log_consumer::LOG_QUEUES {
        assert_eq!(broker.consumer_count(queue.name), Some(0));
    }
}

#[tokio::test]
async fn interrupted_scope_releases_the_session() {
    let broker = MemoryBroker::new();

    let interrupted = timeout(
        Duration::from_millis(50),
        connector(&broker, log_consumer::exchange()).scope(|session| {
            Box::pin(async move {
                log_consumer::run(session, Arc::new(log_consumer::TracingSink)).await
            })
        }),
    )
    .await;
    assert!(interrupted.is_err());

    bounded(async {
        while broker.open_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;

    for queue in log_consumer::LOG_QUEUES {
        assert_eq!(broker.consumer_count(queue.name), Some(0));
    }
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn exited_sessions_leave_nothing_open() {
    let broker = MemoryBroker::new();

    let res = bounded(
        connector(&broker, log_consumer::exchange()).scope(|session| {
            session.stop_consuming();
            Box::pin(async move {
                log_consumer::run(session, Arc::new(log_consumer::TracingSink)).await
            })
        }),
    )
    .await;

    assert_eq!(res, Ok(()));
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.open_channels(), 0);
}


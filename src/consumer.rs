// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Runs the handler registered for the queue a delivery came from, inside a
//! consumer span parented on the publisher's trace context. A handler failure
//! is recorded on the span and returned to the dispatch loop, which treats it
//! as fatal.

use crate::{broker::Delivery, dispatcher::RabbitMQDispatcherDefinition, errors::AmqpError, otel};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap};
use tracing::{debug, error, warn};

/// Runs the handler registered for the delivery's queue inside a consumer
/// span.
///
/// # Parameters
/// * `tracer` - Tracer creating the consumer span
/// * `delivery` - The received message
/// * `defs` - Registrations keyed by queue name
///
/// # Returns
/// * `Result<(), AmqpError>` - `Ok` when the handler succeeded or when no
///   handler is registered (the delivery is rejected without requeue).
///   `AmqpError::HandlerError` when the handler failed
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    defs: &HashMap<String, RabbitMQDispatcherDefinition>,
) -> Result<(), AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &delivery.routing_key);

    debug!(
        queue = %delivery.queue,
        routing_key = %delivery.routing_key,
        delivery_tag = delivery.delivery_tag,
        "received message"
    );

    let Some(dispatcher_def) = defs.get(&delivery.queue) else {
        let msg = "removing message from queue - reason: no handler registered";
        warn!(queue = %delivery.queue, "{}", msg);
        span.set_status(Status::Error {
            description: Cow::from(msg),
        });

        if let Err(err) = delivery.reject(false).await {
            error!(error = err.to_string(), "error rejecting msg");
            span.record_error(&err);
        }

        return Ok(());
    };

    match dispatcher_def.handler.exec(&ctx, delivery).await {
        Ok(()) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
            Ok(())
        }
        Err(err) => {
            error!(
                queue = %delivery.queue,
                error = err.to_string(),
                "handler failed, stopping consumption"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });

            Err(AmqpError::HandlerError {
                queue: delivery.queue.clone(),
                reason: err.0,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{DeliveryAcker, MessageProperties},
        dispatcher::DispatcherDefinition,
        errors::HandlerError,
        handler::FnHandler,
    };
    use async_trait::async_trait;
    use opentelemetry::global;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[derive(Default)]
    struct RejectCounter(AtomicUsize);

    #[async_trait]
    impl DeliveryAcker for RejectCounter {
        async fn ack(&self) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
            Ok(())
        }

        async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
            assert!(!requeue);
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn delivery(queue: &str, auto_ack: bool, acker: Arc<RejectCounter>) -> Delivery {
        Delivery {
            delivery_tag: 7,
            queue: queue.to_owned(),
            exchange: "producer_log".to_owned(),
            routing_key: "user.info".to_owned(),
            redelivered: false,
            data: b"hello".to_vec(),
            properties: MessageProperties::default(),
            auto_ack,
            acker,
        }
    }

    fn defs(fail: bool) -> HashMap<String, RabbitMQDispatcherDefinition> {
        let handler = FnHandler::new(move |_d: &Delivery| {
            if fail {
                Err(HandlerError::new("boom"))
            } else {
                Ok(())
            }
        });

        HashMap::from([(
            "user.info".to_owned(),
            RabbitMQDispatcherDefinition {
                def: DispatcherDefinition::new("user.info"),
                handler: Arc::new(handler),
            },
        )])
    }

    #[tokio::test]
    async fn runs_the_handler_of_the_delivery_queue() {
        let tracer = global::tracer("test");
        let acker = Arc::new(RejectCounter::default());

        let res = consume(&tracer, &delivery("user.info", true, acker), &defs(false)).await;
        assert_eq!(res, Ok(()));
    }

    #[tokio::test]
    async fn wraps_handler_errors_with_the_queue() {
        let tracer = global::tracer("test");
        let acker = Arc::new(RejectCounter::default());

        let res = consume(&tracer, &delivery("user.info", true, acker), &defs(true)).await;
        assert_eq!(
            res,
            Err(AmqpError::HandlerError {
                queue: "user.info".to_owned(),
                reason: "boom".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn rejects_manual_deliveries_without_handler() {
        let tracer = global::tracer("test");
        let acker = Arc::new(RejectCounter::default());

        let res = consume(
            &tracer,
            &delivery("order.info", false, acker.clone()),
            &defs(false),
        )
        .await;

        assert_eq!(res, Ok(()));
        assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    }
}

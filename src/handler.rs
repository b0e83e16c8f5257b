// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Handler capability invoked by the dispatcher for every delivery.

use crate::{broker::Delivery, errors::HandlerError};
use async_trait::async_trait;
use opentelemetry::Context;

/// Processes deliveries from one queue.
///
/// Returning an error stops the dispatch loop. Manual-ack handlers settle the
/// delivery themselves through `Delivery::ack`, `nack` or `reject`.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError>;
}

/// Adapts a synchronous closure into a `ConsumerHandler`.
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Delivery) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        FnHandler { f }
    }
}

#[async_trait]
impl<F> ConsumerHandler for FnHandler<F>
where
    F: Fn(&Delivery) -> Result<(), HandlerError> + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, delivery: &Delivery) -> Result<(), HandlerError> {
        (self.f)(delivery)
    }
}

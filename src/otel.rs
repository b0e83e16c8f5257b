// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Trace context travels in message headers: the publisher injects the
//! caller's context and the dispatcher extracts it to parent the consumer span.
//! Without a global propagator installed both directions are no-ops.

use crate::broker::MessageProperties;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::collections::BTreeMap;

struct HeaderInjector<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, String>,
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the trace context of `ctx` into outgoing message headers.
pub(crate) fn inject_context(ctx: &Context, headers: &mut BTreeMap<String, String>) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut HeaderInjector { headers })
    });
}

/// Extracts the publisher's context from the delivery headers and opens a
/// consumer span named after the routing key.
pub(crate) fn new_span(
    props: &MessageProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor {
            headers: &props.headers,
        })
    });

    let span = tracer
        .span_builder(name.to_owned())
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

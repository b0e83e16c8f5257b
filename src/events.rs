// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Producer-side log events published on the `producer_log` exchange under
//! `<category>.<level>` routing keys.

use crate::{errors::AmqpError, publisher::Publisher};
use opentelemetry::Context;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    User,
    Order,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::User => "user",
            EventCategory::Order => "order",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Error,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Error => "error",
        }
    }
}

/// Routing key of an event, e.g. `user.error`.
pub fn routing_key(category: EventCategory, level: EventLevel) -> String {
    format!("{}.{}", category.as_str(), level.as_str())
}

/// Publishes a log event with the current trace context.
pub async fn publish_event(
    publisher: &dyn Publisher,
    category: EventCategory,
    level: EventLevel,
    body: &str,
) -> Result<(), AmqpError> {
    let key = routing_key(category, level);
    debug!(routing_key = %key, "publishing log event");

    publisher
        .publish(&Context::current(), &key, body.as_bytes())
        .await
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(EventCategory::User),
            "order" => Ok(EventCategory::Order),
            other => Err(format!("unknown event category `{other}`")),
        }
    }
}

impl FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(EventLevel::Info),
            "error" => Ok(EventLevel::Error),
            other => Err(format!("unknown event level `{other}`")),
        }
    }
}

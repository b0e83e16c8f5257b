// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides the exchange types supported by the connector and the
//! `ExchangeDefinition` passed to it at construction time. A connector owns
//! exactly one exchange, so the definition doubles as the connector's routing
//! configuration.

use crate::{errors::ConfigError, routing::topic_matches};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Represents the types of exchanges a connector can own.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Fanout,
    Direct,
    Topic,
}

impl ExchangeKind {
    /// Returns true when a message published with `routing_key` must follow a
    /// binding declared with `binding_key`.
    pub fn routes(&self, binding_key: &str, routing_key: &str) -> bool {
        match self {
            ExchangeKind::Fanout => true,
            ExchangeKind::Direct => binding_key == routing_key,
            ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "fanout" => Ok(ExchangeKind::Fanout),
            "direct" => Ok(ExchangeKind::Direct),
            "topic" => Ok(ExchangeKind::Topic),
            _ => Err(ConfigError::UnsupportedExchangeKind(value.to_owned())),
        }
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Definition of the exchange owned by a connector.
///
/// Built with the builder methods below; exchanges are durable unless
/// explicitly configured otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
}

impl ExchangeDefinition {
    /// Creates a durable fanout exchange definition with the given name.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Fanout,
            durable: true,
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Declares the exchange as transient; it will not survive a broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }
}

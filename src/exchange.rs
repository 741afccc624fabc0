// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! This module provides types for describing RabbitMQ exchanges. Exchanges are
//! the routing mechanism in RabbitMQ that determine how messages are
//! distributed to queues. Besides the standard kinds, the delayed-message and
//! message-deduplication plugin kinds are supported; their arguments are
//! passed through to the broker verbatim.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Argument selecting the underlying routing of a delayed-message exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Argument enabling broker-side deduplication on an exchange or queue
pub const AMQP_HEADERS_MESSAGE_DEDUPLICATION: &str = "x-message-deduplication";
/// Argument sizing the deduplication cache
pub const AMQP_HEADERS_CACHE_SIZE: &str = "x-cache-size";
/// Argument setting the deduplication cache time-to-live in milliseconds
pub const AMQP_HEADERS_CACHE_TTL: &str = "x-cache-ttl";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Delayed message delivery (plugin required)
/// - XMessageDeduplication: Deduplicating exchange (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum ExchangeKind {
    #[default]
    #[serde(rename = "direct")]
    Direct,
    #[serde(rename = "fanout")]
    Fanout,
    #[serde(rename = "topic")]
    Topic,
    #[serde(rename = "headers")]
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
    #[serde(rename = "x-message-deduplication")]
    XMessageDeduplication,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
            ExchangeKind::XMessageDeduplication => {
                lapin::ExchangeKind::Custom("x-message-deduplication".to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange.
///
/// The name is the unique key within a topology. Declaring the same spec twice
/// is a no-op on the broker, which is what makes replay after reconnect safe.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, Value>,
}

impl ExchangeSpec {
    /// Creates a direct, non-durable exchange spec.
    pub fn new(name: &str) -> ExchangeSpec {
        ExchangeSpec {
            name: name.to_owned(),
            ..ExchangeSpec::default()
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Turns the exchange into a delayed exchange routing like `routing`
    /// (`"direct"`, `"fanout"`, ...).
    ///
    /// This requires the x-delayed-message plugin to be installed on the
    /// RabbitMQ server.
    pub fn delayed(mut self, routing: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.arguments.insert(
            AMQP_HEADERS_DELAYED_EXCHANGE_TYPE.to_owned(),
            Value::from(routing),
        );
        self
    }

    /// Turns the exchange into a deduplicating exchange remembering up to
    /// `cache_size` keys for `cache_ttl_ms` milliseconds.
    ///
    /// This requires the message-deduplication plugin.
    pub fn deduplicated(mut self, cache_size: i64, cache_ttl_ms: i64) -> Self {
        self.kind = ExchangeKind::XMessageDeduplication;
        self.arguments.insert(
            AMQP_HEADERS_MESSAGE_DEDUPLICATION.to_owned(),
            Value::from("true"),
        );
        self.arguments
            .insert(AMQP_HEADERS_CACHE_SIZE.to_owned(), Value::from(cache_size));
        self.arguments
            .insert(AMQP_HEADERS_CACHE_TTL.to_owned(), Value::from(cache_ttl_ms));
        self
    }

    /// Adds a single argument, passed to the broker as-is.
    pub fn argument(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test-only accessor: lapin's `ExchangeKind::kind()` is `pub(crate)`,
    /// so mirror its name mapping here.
    trait LapinKindName {
        fn kind(&self) -> &str;
    }

    impl LapinKindName for lapin::ExchangeKind {
        fn kind(&self) -> &str {
            match self {
                Self::Custom(c) => c.as_str(),
                Self::Direct => "direct",
                Self::Fanout => "fanout",
                Self::Headers => "headers",
                Self::Topic => "topic",
            }
        }
    }

    #[test]
    fn delayed_exchange_carries_routing_type() {
        let spec = ExchangeSpec::new("delay_exchange").delayed("direct").durable();

        assert_eq!(spec.kind, ExchangeKind::XMessageDelayed);
        assert!(spec.durable);
        assert_eq!(
            spec.arguments.get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&Value::from("direct"))
        );
    }

    #[test]
    fn deduplicated_exchange_carries_cache_settings() {
        let spec = ExchangeSpec::new("dedup_exchange").deduplicated(10000, 60000);

        assert_eq!(spec.kind, ExchangeKind::XMessageDeduplication);
        assert_eq!(spec.arguments.get(AMQP_HEADERS_CACHE_SIZE), Some(&Value::from(10000)));
        assert_eq!(spec.arguments.get(AMQP_HEADERS_CACHE_TTL), Some(&Value::from(60000)));
    }

    #[test]
    fn plugin_kinds_map_to_custom_lapin_kinds() {
        assert_eq!(
            lapin::ExchangeKind::from(&ExchangeKind::XMessageDeduplication).kind(),
            "x-message-deduplication"
        );
        assert_eq!(lapin::ExchangeKind::from(&ExchangeKind::Topic).kind(), "topic");
    }
}

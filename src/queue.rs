// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides the queue description used by the topology. A queue
//! spec carries its own binding (exchange and routing key) so that declaring
//! and binding happen together on every (re)connect.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Argument selecting the queue implementation (`classic`, `quorum`, `stream`)
pub const AMQP_HEADERS_QUEUE_TYPE: &str = "x-queue-type";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";

/// Definition of a RabbitMQ queue and its binding.
///
/// Queues are durable unless stated otherwise. An empty `exchange` leaves the
/// queue on the default exchange and skips the bind call.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueSpec {
    pub name: String,
    pub exchange: String,
    pub routing_key: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, Value>,
}

impl Default for QueueSpec {
    fn default() -> Self {
        QueueSpec {
            name: String::new(),
            exchange: String::new(),
            routing_key: String::new(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            arguments: BTreeMap::new(),
        }
    }
}

impl QueueSpec {
    /// Creates a durable queue spec with the given name.
    pub fn new(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_owned(),
            ..QueueSpec::default()
        }
    }

    /// Binds the queue to `exchange` with `routing_key`.
    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    /// Makes the queue transient, dropped on broker restart.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Selects the queue implementation, e.g. `quorum`.
    pub fn queue_type(self, kind: &str) -> Self {
        self.argument(AMQP_HEADERS_QUEUE_TYPE, kind)
    }

    /// Sets the message Time-To-Live (TTL) for the queue in milliseconds.
    pub fn ttl(self, ttl: i64) -> Self {
        self.argument(AMQP_HEADERS_MESSAGE_TTL, ttl)
    }

    /// Adds a single argument, passed to the broker as-is.
    pub fn argument(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(key.to_owned(), value.into());
        self
    }

    /// Whether this queue needs an explicit bind call.
    pub(crate) fn is_bound(&self) -> bool {
        !self.exchange.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queues_are_durable_by_default() {
        let spec = QueueSpec::new("jobs");
        assert!(spec.durable);
        assert!(!spec.exclusive);
        assert!(!spec.is_bound());
    }

    #[test]
    fn builder_sets_binding_and_arguments() {
        let spec = QueueSpec::new("dedup_queue")
            .bind("dedup_exchange", "dedup_key")
            .queue_type("quorum")
            .argument("x-message-deduplication", "true");

        assert!(spec.is_bound());
        assert_eq!(spec.routing_key, "dedup_key");
        assert_eq!(
            spec.arguments.get(AMQP_HEADERS_QUEUE_TYPE),
            Some(&Value::from("quorum"))
        );
        assert_eq!(spec.arguments.len(), 2);
    }
}

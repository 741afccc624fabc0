// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Debounce Pipeline
//!
//! Broker-side debouncing built from two plugin exchanges and a shovel:
//!
//! ```text
//! publish -> delay_exchange (x-delayed-message) -> delay_queue
//!         -> shovel -> dedup_exchange (x-message-deduplication) -> dedup_queue
//! ```
//!
//! Jobs wait in the delayed exchange, and identical jobs arriving at the
//! deduplication exchange within the cache TTL are dropped by the broker.
//! The TTL has to cover the longest delay in use.

use crate::{
    config::BrokerOptions,
    errors::AmqpError,
    exchange::ExchangeSpec,
    exchange::AMQP_HEADERS_MESSAGE_DEDUPLICATION,
    publisher::RabbitMQPublisher,
    queue::QueueSpec,
    shovel::ShovelSpec,
    topology::Topology,
};
use opentelemetry::Context;
use serde::Deserialize;

/// Names and cache settings of the debounce pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DebouncePipeline {
    pub delay_exchange: String,
    pub delay_queue: String,
    pub dedup_exchange: String,
    pub dedup_queue: String,
    pub routing_key: String,
    pub shovel_name: String,
    pub cache_size: i64,
    pub cache_ttl_ms: i64,
}

impl Default for DebouncePipeline {
    fn default() -> Self {
        DebouncePipeline {
            delay_exchange: "delay_exchange".to_owned(),
            delay_queue: "delay_queue".to_owned(),
            dedup_exchange: "dedup_exchange".to_owned(),
            dedup_queue: "dedup_queue".to_owned(),
            routing_key: "dedup_key".to_owned(),
            shovel_name: "shovel_delay_to_dedup".to_owned(),
            cache_size: 10_000,
            cache_ttl_ms: 60_000,
        }
    }
}

impl DebouncePipeline {
    /// Exchanges and queues of the pipeline, in declaration order.
    pub fn topology(&self) -> Topology {
        Topology::new()
            .exchange(ExchangeSpec::new(&self.delay_exchange).delayed("direct"))
            .exchange(
                ExchangeSpec::new(&self.dedup_exchange)
                    .delayed("direct")
                    .deduplicated(self.cache_size, self.cache_ttl_ms),
            )
            .queue(QueueSpec::new(&self.delay_queue).bind(&self.delay_exchange, &self.routing_key))
            .queue(
                QueueSpec::new(&self.dedup_queue)
                    .bind(&self.dedup_exchange, &self.routing_key)
                    .queue_type("quorum")
                    .argument(AMQP_HEADERS_MESSAGE_DEDUPLICATION, "true"),
            )
    }

    /// Shovel forwarding the delay queue into the deduplication exchange.
    pub fn shovel(&self, options: &BrokerOptions) -> ShovelSpec {
        let uri = options.amqp_uri();

        ShovelSpec::new(
            &self.shovel_name,
            &uri,
            &self.delay_queue,
            &self.dedup_exchange,
            &self.routing_key,
        )
        .ack_mode("on-confirm")
    }

    /// Queues a job delayed by `delay_ms`; returns the job id.
    pub async fn queue_job(
        &self,
        publisher: &RabbitMQPublisher,
        ctx: &Context,
        message: &str,
        delay_ms: i64,
    ) -> Result<String, AmqpError> {
        publisher
            .queue_job(ctx, &self.delay_exchange, &self.routing_key, message, delay_ms)
            .await
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module provides functionality for describing the broker topology and
//! installing it over a live channel. The topology includes exchanges, queues
//! and the bindings between them. Installation is replayed in full after
//! every successful (re)connect; every declaration is idempotent on the
//! broker so replay never changes existing entities.

use crate::{exchange::ExchangeSpec, errors::AmqpError, queue::QueueSpec, transport::BrokerChannel};
use serde::Deserialize;
use tracing::{debug, error, info};

/// Exchanges and queues to declare on the broker.
///
/// Names are unique keys: adding a spec whose name is already present
/// replaces the earlier one in place, keeping declaration order stable.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
}

impl Topology {
    pub fn new() -> Topology {
        Topology::default()
    }

    /// Adds an exchange definition to the topology.
    pub fn exchange(mut self, def: ExchangeSpec) -> Self {
        match self.exchanges.iter_mut().find(|e| e.name == def.name) {
            Some(existing) => *existing = def,
            None => self.exchanges.push(def),
        }
        self
    }

    /// Adds a queue definition to the topology.
    pub fn queue(mut self, def: QueueSpec) -> Self {
        match self.queues.iter_mut().find(|q| q.name == def.name) {
            Some(existing) => *existing = def,
            None => self.queues.push(def),
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty()
    }

    /// Installs the topology over the given channel.
    ///
    /// All exchanges are declared first, then every queue is declared and
    /// bound to its exchange.
    pub async fn install(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        self.install_exchanges(channel).await?;
        self.install_queues(channel).await
    }

    async fn install_exchanges(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name);

            if let Err(err) = channel.declare_exchange(exch).await {
                error!(
                    error = err.to_string(),
                    name = %exch.name,
                    "error to declare the exchange"
                );
                return Err(err);
            }

            info!(exchange = %exch.name, "Declared exchange");
        }

        Ok(())
    }

    async fn install_queues(&self, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
        for def in &self.queues {
            debug!("creating queue: {}", def.name);

            if let Err(err) = channel.declare_queue(def).await {
                error!(error = err.to_string(), name = %def.name, "error to declare the queue");
                return Err(err);
            }

            info!(queue = %def.name, "Declared queue");

            if !def.is_bound() {
                continue;
            }

            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                def.name, def.exchange, def.routing_key
            );

            if let Err(err) = channel
                .bind_queue(&def.name, &def.exchange, &def.routing_key)
                .await
            {
                error!(error = err.to_string(), "error to bind queue to exchange");
                return Err(err);
            }

            info!(queue = %def.name, exchange = %def.exchange, "Bound queue");
        }

        Ok(())
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! The connection manager never talks to a client library directly. It opens
//! connections through a [`Transport`] and issues every broker call through
//! the resulting [`BrokerChannel`]. Transports report loss of connectivity
//! through a [`FaultNotifier`], which is safe to call from any thread and
//! never blocks.
//!
//! The live channel is published in a [`ChannelSlot`]: a replaceable handle
//! that ack/nack and publish paths read on every use instead of capturing a
//! channel instance.

use crate::{config::BrokerOptions, errors::AmqpError, exchange::ExchangeSpec, queue::QueueSpec};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::BasicProperties;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};
use tokio::sync::mpsc::UnboundedSender;

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// A message delivered to a consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

/// Opens connections to the broker.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a connection and a channel on it.
    ///
    /// Loss of the connection must be reported through `faults`.
    async fn connect(
        &self,
        options: &BrokerOptions,
        faults: FaultNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}

/// Operations issued against a single live connection/channel pair.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether both the connection and the channel are still usable.
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError>;

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Subscribes to `queue` with manual acknowledgements.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Closes the channel and its connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// The three independent sources of connection loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultSignal {
    ConnectionShutdown(String),
    CallbackException(String),
    ConnectionBlocked(String),
}

impl fmt::Display for FaultSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultSignal::ConnectionShutdown(reason) => write!(f, "connection shutdown: {reason}"),
            FaultSignal::CallbackException(reason) => write!(f, "callback exception: {reason}"),
            FaultSignal::ConnectionBlocked(reason) => write!(f, "connection blocked: {reason}"),
        }
    }
}

/// A fault signal tagged with the connection generation it belongs to.
#[derive(Debug, Clone)]
pub(crate) struct Fault {
    pub(crate) generation: u64,
    pub(crate) signal: FaultSignal,
}

/// Hands fault signals from transport callbacks to the connection manager.
#[derive(Debug, Clone)]
pub struct FaultNotifier {
    generation: u64,
    tx: UnboundedSender<Fault>,
}

impl FaultNotifier {
    pub(crate) fn new(generation: u64, tx: UnboundedSender<Fault>) -> Self {
        FaultNotifier { generation, tx }
    }

    /// Generation of the connection this notifier was issued for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Reports a fault; returns immediately.
    pub fn notify(&self, signal: FaultSignal) {
        // the receiver is gone once the manager has closed
        let _ = self.tx.send(Fault {
            generation: self.generation,
            signal,
        });
    }
}

/// A live channel together with the connection generation it belongs to.
#[derive(Clone)]
pub struct LiveChannel {
    pub generation: u64,
    pub channel: Arc<dyn BrokerChannel>,
}

/// Replaceable handle to the current live channel.
#[derive(Clone, Default)]
pub struct ChannelSlot {
    inner: Arc<RwLock<Option<LiveChannel>>>,
}

impl ChannelSlot {
    /// The current live channel, if any.
    pub fn current(&self) -> Option<LiveChannel> {
        self.inner.read().clone()
    }

    /// The current channel, only if it still belongs to `generation`.
    pub fn for_generation(&self, generation: u64) -> Option<Arc<dyn BrokerChannel>> {
        self.inner
            .read()
            .as_ref()
            .filter(|live| live.generation == generation)
            .map(|live| live.channel.clone())
    }

    pub(crate) fn replace(&self, live: Option<LiveChannel>) -> Option<LiveChannel> {
        std::mem::replace(&mut *self.inner.write(), live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn slot_only_resolves_matching_generation() {
        let slot = ChannelSlot::default();
        assert!(slot.current().is_none());

        let channel: Arc<dyn BrokerChannel> = Arc::new(MockBrokerChannel::new());
        slot.replace(Some(LiveChannel { generation: 3, channel }));

        assert!(slot.for_generation(3).is_some());
        assert!(slot.for_generation(2).is_none());

        let previous = slot.replace(None);
        assert_eq!(previous.map(|live| live.generation), Some(3));
        assert!(slot.for_generation(3).is_none());
    }

    #[test]
    fn notifier_tags_signals_with_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let notifier = FaultNotifier::new(7, tx);

        notifier.notify(FaultSignal::ConnectionBlocked("low memory".to_owned()));

        let fault = rx.try_recv().unwrap();
        assert_eq!(fault.generation, 7);
        assert_eq!(
            fault.signal,
            FaultSignal::ConnectionBlocked("low memory".to_owned())
        );
    }
}

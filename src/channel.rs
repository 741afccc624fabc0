// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! The production [`Transport`], backed by `lapin`. It establishes a
//! connection to the RabbitMQ server, creates one channel on it and wires the
//! connection and channel error callbacks to the manager's fault notifier.
//! [`LapinChannel`] then carries out topology, consume, settle and publish
//! calls on that pair.

use crate::{
    config::BrokerOptions,
    errors::AmqpError,
    exchange::ExchangeSpec,
    queue::QueueSpec,
    transport::{BrokerChannel, Delivery, DeliveryStream, FaultNotifier, FaultSignal, Transport},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::Value;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error, warn};

/// Reply code used when closing connections on purpose.
const REPLY_SUCCESS: u16 = 200;

/// Opens `lapin` connections.
#[derive(Debug, Clone)]
pub struct LapinTransport {
    connection_name: String,
}

impl LapinTransport {
    /// Creates a transport announcing itself to the broker as `connection_name`.
    pub fn new(connection_name: &str) -> Self {
        LapinTransport {
            connection_name: connection_name.to_owned(),
        }
    }
}

impl Default for LapinTransport {
    fn default() -> Self {
        LapinTransport::new(env!("CARGO_PKG_NAME"))
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        options: &BrokerOptions,
        faults: FaultNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp connection...");
        let properties = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&options.amqp_uri(), properties).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                // the half-open connection is useless without its channel
                let _ = conn.close(REPLY_SUCCESS, "channel creation failed").await;
                Err(AmqpError::ChannelError)
            }
        }?;
        debug!("channel created");

        let shutdown = faults.clone();
        conn.on_error(move |err| {
            shutdown.notify(FaultSignal::ConnectionShutdown(err.to_string()));
        });

        let callback = faults;
        channel.on_error(move |err| {
            callback.notify(FaultSignal::CallbackException(err.to_string()));
        });

        Ok(Arc::new(LapinChannel {
            connection: conn,
            channel,
        }))
    }
}

/// A `lapin` connection with its single channel.
pub struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &spec.name,
                lapin::ExchangeKind::from(&spec.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    internal: false,
                    nowait: false,
                },
                field_table(&spec.arguments),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = %spec.name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(spec.name.clone())
            })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    nowait: false,
                },
                field_table(&spec.arguments),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), name = %spec.name, "error to declare the queue");
                AmqpError::DeclareQueueError(spec.name.clone())
            })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::BindingConsumerError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(|delivery| Delivery {
                        delivery_tag: delivery.delivery_tag,
                        data: delivery.data,
                        properties: delivery.properties,
                    })
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|_| AmqpError::AckMessageError)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|_| AmqpError::NackMessageError)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
            // a channel on a dead connection cannot be closed cleanly
            warn!(error = err.to_string(), "failure to close the channel");
        }

        self.connection
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| AmqpError::CloseError(err.to_string()))
    }
}

/// Converts spec arguments into an AMQP field table.
///
/// Strings, booleans and numbers map to their AMQP counterparts; anything
/// else is passed as its JSON text.
pub(crate) fn field_table(arguments: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = BTreeMap::new();

    for (key, value) in arguments {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }

    FieldTable::from(table)
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            _ => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_keep_their_types() {
        let mut args = BTreeMap::new();
        args.insert("x-delayed-type".to_owned(), json!("direct"));
        args.insert("x-cache-size".to_owned(), json!(10000));
        args.insert("x-cache-persistence".to_owned(), json!(false));
        args.insert("x-ratio".to_owned(), json!(0.5));

        let table = field_table(&args);
        let inner = table.inner();

        assert_eq!(
            inner.get("x-delayed-type"),
            Some(&AMQPValue::LongString(LongString::from("direct")))
        );
        assert_eq!(inner.get("x-cache-size"), Some(&AMQPValue::LongLongInt(10000)));
        assert_eq!(inner.get("x-cache-persistence"), Some(&AMQPValue::Boolean(false)));
        assert_eq!(inner.get("x-ratio"), Some(&AMQPValue::Double(0.5)));
    }

    #[test]
    fn nested_values_are_passed_as_json_text() {
        let mut args = BTreeMap::new();
        args.insert("x-nested".to_owned(), json!({"a": 1}));

        assert_eq!(
            field_table(&args).inner().get("x-nested"),
            Some(&AMQPValue::LongString(LongString::from(r#"{"a":1}"#)))
        );
    }
}

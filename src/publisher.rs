// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module provides functionality for publishing messages to RabbitMQ exchanges.
//! The publisher resolves the live channel on every call, so it keeps working
//! across reconnects, and propagates OpenTelemetry context in message headers.
//!
//! [`RabbitMQPublisher::queue_job`] publishes a debounced job: the message id is
//! the SHA-256 of the payload and is repeated in the deduplication header, so
//! identical jobs published within the broker's deduplication window collapse
//! into one.

use crate::{errors::AmqpError, otel, transport::ChannelSlot};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Delay header understood by the delayed-message exchange.
pub const AMQP_HEADERS_DELAY: &str = "x-delay";

/// Deduplication key header understood by the deduplication exchange.
pub const AMQP_HEADERS_DEDUPLICATION: &str = "x-deduplication-header";

/// Typed header values.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
    LongUint(u32),
}

impl From<&HeaderValues> for AMQPValue {
    fn from(value: &HeaderValues) -> Self {
        match value.clone() {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    /// Generated when absent.
    pub message_id: Option<String>,
    pub headers: Option<HashMap<String, HeaderValues>>,
    pub data: Vec<u8>,
}

impl PublishMessage {
    pub fn new(to: &str, key: &str, data: &[u8]) -> Self {
        PublishMessage {
            to: to.to_owned(),
            key: Some(key.to_owned()),
            data: data.to_vec(),
            ..PublishMessage::default()
        }
    }

    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value);
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }
}

/// SHA-256 of the payload as lowercase hex.
pub fn content_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);

    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Publishes messages over the manager's live channel.
#[derive(Clone)]
pub struct RabbitMQPublisher {
    channels: ChannelSlot,
}

impl RabbitMQPublisher {
    pub fn new(channels: ChannelSlot) -> RabbitMQPublisher {
        RabbitMQPublisher { channels }
    }

    /// Publishes a message to RabbitMQ.
    ///
    /// Fails with [`AmqpError::NotConnected`] while no channel is live, for
    /// example in the middle of a reconnect.
    pub async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let Some(live) = self.channels.current() else {
            return Err(AmqpError::NotConnected);
        };

        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        otel::inject(ctx, &mut btree);

        if let Some(headers) = &infos.headers {
            for (key, value) in headers {
                btree.insert(ShortString::from(key.clone()), AMQPValue::from(value));
            }
        }

        let message_id = infos
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(infos.msg_type.clone().unwrap_or_default()))
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(btree));

        live.channel
            .publish(
                &infos.to,
                &infos.key.clone().unwrap_or_default(),
                &infos.data,
                properties,
            )
            .await
    }

    /// Publishes a debounced job and returns its id.
    ///
    /// The id is the payload hash; it is used as message id and as the
    /// deduplication key, and `delay_ms` is set as the delay header.
    pub async fn queue_job(
        &self,
        ctx: &Context,
        exchange: &str,
        routing_key: &str,
        message: &str,
        delay_ms: i64,
    ) -> Result<String, AmqpError> {
        let hash = content_hash(message.as_bytes());

        let msg = PublishMessage::new(exchange, routing_key, message.as_bytes())
            .message_id(&hash)
            .header(AMQP_HEADERS_DELAY, HeaderValues::LongLongInt(delay_ms))
            .header(AMQP_HEADERS_DEDUPLICATION, HeaderValues::LongString(hash.clone()));

        self.publish(ctx, &msg).await?;
        debug!(job_id = %hash, exchange, delay_ms, "job queued");

        Ok(hash)
    }
}

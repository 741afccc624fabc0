// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for RabbitMQ Implementation
//!
//! This module provides the error types shared by the connection manager, the
//! consumer dispatcher, the publisher and the plugins. `AmqpError` covers
//! connection, channel, topology and delivery failures; `HandlerError` is the
//! outcome a message handler reports back to the dispatcher.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-level variants are retried locally by the connection manager and
/// only `ConnectionFailure` is ever surfaced as fatal. Configuration and plugin
/// variants abort startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error closing the connection or the channel
    #[error("failure to close the connection `{0}`")]
    CloseError(String),

    /// No live channel is available right now
    #[error("not connected")]
    NotConnected,

    /// The connection manager was started more than once
    #[error("connection manager already started")]
    AlreadyStarted,

    /// The initial connect loop was cancelled by the host
    #[error("connect cancelled")]
    Cancelled,

    /// Connecting kept failing until the retry budget ran out
    #[error("failed to connect to rabbitmq after {attempts} attempts")]
    ConnectionFailure { attempts: u32 },

    /// A plugin reported a failure
    #[error("plugin failure `{0}`")]
    PluginError(String),

    /// The management API rejected a shovel configuration
    #[error("failed to add shovel configuration `{name}`: {status} {reason}\n{body}")]
    ShovelError {
        name: String,
        status: u16,
        reason: String,
        body: String,
    },

    /// The management API could not be reached
    #[error("failed to send shovel configuration `{name}`: {reason}")]
    ShovelRequestError { name: String, reason: String },

    /// Configuration could not be loaded or is invalid
    #[error("invalid configuration `{0}`")]
    ConfigError(String),
}

/// Failure reported by a message handler.
///
/// Every variant results in the delivery being negatively acknowledged with
/// requeue. `Failed` and `Decode` are additionally logged together with the raw
/// payload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler declined the message
    #[error("message rejected by handler")]
    Rejected,

    /// The handler raised an error while processing the message
    #[error("handler failure `{0}`")]
    Failed(String),

    /// The payload could not be decoded into the shape the handler expects
    #[error("failure to decode payload `{0}`")]
    Decode(String),
}

impl HandlerError {
    /// Wraps any displayable error as a handler failure.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient RabbitMQ Connection Management
//!
//! Keeps a RabbitMQ connection alive on behalf of a host application. The
//! [`ConnectionManager`] connects, declares the [`Topology`], runs
//! [`Plugin`] hooks and starts one consumer per registered handler; when the
//! connection is lost it reconnects with capped exponential backoff and
//! replays all of it. Handler outcomes become acks or requeuing nacks.

mod otel;

pub mod backoff;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod manager;
pub mod pipeline;
pub mod plugin;
pub mod publisher;
pub mod queue;
pub mod shovel;
pub mod topology;
pub mod transport;

pub use config::{BrokerOptions, Settings};
pub use errors::{AmqpError, HandlerError};
pub use handler::{handler_fn, json_handler, text_handler, ConsumerHandler, ConsumerMessage};
pub use manager::{ConnectionEvent, ConnectionManager, ConnectionState};
pub use plugin::Plugin;
pub use topology::Topology;

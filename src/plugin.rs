// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Manager Plugins
//!
//! Collaborators that need to act on the connection lifecycle implement
//! [`Plugin`]. `on_started` runs once when the manager starts, after the
//! topology has been declared; `on_connected` runs after every successful
//! connect, including reconnects. Plugins run in registration order and the
//! first failure stops the sequence and propagates.

use crate::errors::AmqpError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Lifecycle hooks invoked by the connection manager.
///
/// Both operations are required; a plugin that does not care about one of
/// them returns `Ok(())`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Human readable name used in logs.
    fn name(&self) -> &str;

    /// Called once after the first successful connect and topology declaration.
    async fn on_started(&self, cancel: &CancellationToken) -> Result<(), AmqpError>;

    /// Called after every successful connect.
    async fn on_connected(&self, cancel: &CancellationToken) -> Result<(), AmqpError>;
}

/// Runs `on_started` on every plugin, in order.
pub(crate) async fn notify_started(
    plugins: &[Arc<dyn Plugin>],
    cancel: &CancellationToken,
) -> Result<(), AmqpError> {
    for plugin in plugins {
        plugin.on_started(cancel).await?;
    }

    Ok(())
}

/// Runs `on_connected` on every plugin, in order.
pub(crate) async fn notify_connected(
    plugins: &[Arc<dyn Plugin>],
    cancel: &CancellationToken,
) -> Result<(), AmqpError> {
    for plugin in plugins {
        plugin.on_connected(cancel).await?;
    }

    Ok(())
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Shovel Configuration
//!
//! Installs dynamic shovels through the RabbitMQ management HTTP API when the
//! connection manager starts. Forwarding itself is done by the broker; this
//! module only issues the `PUT /api/parameters/shovel/{vhost}/{name}` calls.
//! A rejected configuration aborts startup.

use crate::{
    config::{encode, BrokerOptions},
    errors::AmqpError,
    plugin::Plugin,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

fn default_reconnect_delay() -> u32 {
    5
}

fn default_forward_headers() -> bool {
    true
}

/// A dynamic shovel, serialized with the management API's field names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ShovelSpec {
    /// Parameter name; part of the URL, never of the body.
    #[serde(skip_serializing)]
    pub name: String,
    pub src_uri: String,
    pub src_queue: String,
    pub dest_uri: String,
    pub dest_exchange: String,
    pub dest_exchange_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_mode: Option<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: u32,
    #[serde(rename = "dest-add-forward-headers", default = "default_forward_headers")]
    pub add_forward_headers: bool,
}

impl ShovelSpec {
    /// Shovel moving messages from `src_queue` to `dest_exchange` on one broker.
    pub fn new(name: &str, uri: &str, src_queue: &str, dest_exchange: &str, key: &str) -> Self {
        ShovelSpec {
            name: name.to_owned(),
            src_uri: uri.to_owned(),
            src_queue: src_queue.to_owned(),
            dest_uri: uri.to_owned(),
            dest_exchange: dest_exchange.to_owned(),
            dest_exchange_key: key.to_owned(),
            ack_mode: None,
            reconnect_delay: default_reconnect_delay(),
            add_forward_headers: default_forward_headers(),
        }
    }

    pub fn ack_mode(mut self, mode: &str) -> Self {
        self.ack_mode = Some(mode.to_owned());
        self
    }

    /// Name as it appears in the management URL.
    pub fn encoded_name(&self) -> String {
        encode(self.name.trim())
    }
}

#[derive(Serialize)]
struct ShovelParameter<'a> {
    value: &'a ShovelSpec,
}

/// Plugin applying shovel definitions once at startup.
pub struct ShovelPlugin {
    client: reqwest::Client,
    base_url: String,
    vhost: String,
    username: String,
    password: String,
    shovels: Vec<ShovelSpec>,
}

impl ShovelPlugin {
    pub fn new(options: &BrokerOptions, shovels: Vec<ShovelSpec>) -> Self {
        ShovelPlugin::with_client(reqwest::Client::new(), options, shovels)
    }

    pub fn with_client(
        client: reqwest::Client,
        options: &BrokerOptions,
        shovels: Vec<ShovelSpec>,
    ) -> Self {
        ShovelPlugin {
            client,
            base_url: options.management_base_url(),
            vhost: options.management_vhost(),
            username: options.username.clone(),
            password: options.password.clone(),
            shovels,
        }
    }

    fn url(&self, spec: &ShovelSpec) -> String {
        format!(
            "{}/api/parameters/shovel/{}/{}",
            self.base_url,
            self.vhost,
            spec.encoded_name()
        )
    }

    async fn apply(&self, spec: &ShovelSpec) -> Result<(), AmqpError> {
        let response = self
            .client
            .put(self.url(spec))
            .basic_auth(&self.username, Some(&self.password))
            .json(&ShovelParameter { value: spec })
            .send()
            .await
            .map_err(|err| {
                error!(shovel = %spec.name, error = %err, "Failed to apply shovel configuration");
                AmqpError::ShovelRequestError {
                    name: spec.name.clone(),
                    reason: err.to_string(),
                }
            })?;

        let status = response.status();
        if status.is_success() {
            info!(shovel = %spec.name, "Applied shovel configuration");
            return Ok(());
        }

        let reason = status.canonical_reason().unwrap_or_default().to_owned();
        let body = response.text().await.unwrap_or_default();
        error!(
            shovel = %spec.name,
            status = status.as_u16(),
            body = %body,
            "Failed to apply shovel configuration"
        );

        Err(AmqpError::ShovelError {
            name: spec.name.clone(),
            status: status.as_u16(),
            reason,
            body,
        })
    }
}

#[async_trait]
impl Plugin for ShovelPlugin {
    fn name(&self) -> &str {
        "shovel"
    }

    async fn on_started(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        for spec in &self.shovels {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                result = self.apply(spec) => result?,
            }
        }

        Ok(())
    }

    async fn on_connected(&self, _cancel: &CancellationToken) -> Result<(), AmqpError> {
        Ok(())
    }
}

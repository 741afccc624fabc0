// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! Bridges broker deliveries to registered handlers and turns handler
//! outcomes into acknowledgements. Every delivery resolves to exactly one
//! ack (handler succeeded) or one nack with requeue (handler rejected the
//! message, failed, panicked or could not decode it).
//!
//! Deliveries of one consumer are dispatched in the order the broker sends
//! them; each handler invocation then runs on its own task so a slow handler
//! never blocks the delivery stream.
//!
//! Acks and nacks are issued on the channel the delivery arrived on. When
//! that channel has been replaced by a reconnect in the meantime, the
//! settlement is skipped: delivery tags are channel scoped and the broker
//! redelivers everything left unacknowledged on the closed channel.

use crate::{
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
    transport::{ChannelSlot, Delivery, DeliveryStream},
};
use futures_util::{FutureExt, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error, warn, Instrument};

/// A handler registered for a queue.
///
/// Registrations are append-only and replayed after every reconnect.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub queue: String,
    pub handler: Arc<dyn ConsumerHandler>,
}

/// How a delivery was settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    /// The channel was replaced before settling; the broker redelivers.
    Abandoned,
}

/// Dispatches the deliveries of one consumer.
pub(crate) struct Dispatch {
    pub(crate) queue: String,
    pub(crate) generation: u64,
    pub(crate) handler: Arc<dyn ConsumerHandler>,
    pub(crate) channels: ChannelSlot,
}

impl Dispatch {
    /// Reads the delivery stream until it ends, spawning one task per delivery.
    pub(crate) async fn run(self: Arc<Self>, mut stream: DeliveryStream) {
        while let Some(result) = stream.next().await {
            match result {
                Ok(delivery) => {
                    let dispatch = self.clone();
                    tokio::spawn(
                        async move {
                            if let Err(err) = dispatch.handle(delivery).await {
                                error!(error = err.to_string(), "error consume msg");
                            }
                        }
                        .in_current_span(),
                    );
                }

                Err(err) => error!(error = err.to_string(), queue = %self.queue, "errors consume msg"),
            }
        }

        debug!(queue = %self.queue, generation = self.generation, "consumer stream ended");
    }

    /// Invokes the handler for one delivery and settles it.
    pub(crate) async fn handle(&self, delivery: Delivery) -> Result<Settlement, AmqpError> {
        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::new_span(&delivery.properties, &tracer, &self.queue);

        debug!(
            queue = %self.queue,
            delivery_tag = delivery.delivery_tag,
            "received message"
        );

        let msg = ConsumerMessage {
            queue: self.queue.clone(),
            delivery_tag: delivery.delivery_tag,
            data: delivery.data,
            properties: delivery.properties,
        };

        let outcome = AssertUnwindSafe(self.handler.exec(&ctx, &msg))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(HandlerError::Failed("handler panicked".to_owned())));

        let requeue = match outcome {
            Ok(()) => {
                debug!("message successfully processed");
                false
            }
            Err(HandlerError::Rejected) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = msg.delivery_tag,
                    "message rejected by handler, requeuing"
                );
                true
            }
            Err(err) => {
                error!(
                    queue = %self.queue,
                    payload = %msg.text_lossy(),
                    error = %err,
                    "Failed to handle message"
                );
                span.record_error(&err);
                true
            }
        };

        let settled = self.settle(msg.delivery_tag, requeue).await;

        match &settled {
            Ok(Settlement::Acked) => span.set_status(Status::Ok),
            Ok(_) => span.set_status(Status::Error {
                description: Cow::from("message requeued"),
            }),
            Err(err) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from("error to settle msg"),
                });
            }
        }

        settled
    }

    async fn settle(&self, delivery_tag: u64, requeue: bool) -> Result<Settlement, AmqpError> {
        let Some(channel) = self.channels.for_generation(self.generation) else {
            warn!(
                queue = %self.queue,
                delivery_tag,
                "channel replaced before settling, leaving message for redelivery"
            );
            return Ok(Settlement::Abandoned);
        };

        if requeue {
            channel.nack(delivery_tag, true).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })?;
            return Ok(Settlement::Requeued);
        }

        channel.ack(delivery_tag).await.map_err(|err| {
            error!(error = err.to_string(), "error whiling ack msg");
            AmqpError::AckMessageError
        })?;

        Ok(Settlement::Acked)
    }
}

// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The callback side of the consumer dispatcher. A handler receives one
//! delivered message and reports whether it was processed. `Ok(())` leads to
//! an acknowledgement; any [`HandlerError`] leads to a negative
//! acknowledgement with requeue.
//!
//! Besides implementing [`ConsumerHandler`] directly, handlers can be built
//! from closures over the raw message ([`handler_fn`]), over UTF-8 text
//! ([`text_handler`]) or over a JSON-decoded value ([`json_handler`]).

use crate::errors::HandlerError;
use async_trait::async_trait;
use lapin::BasicProperties;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{future::Future, marker::PhantomData, sync::Arc};

/// A message handed to a handler.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub delivery_tag: u64,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl ConsumerMessage {
    /// The payload as text, with invalid UTF-8 replaced.
    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Processes messages delivered from one queue.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Handler built from a closure over the raw message.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps a closure taking the raw [`ConsumerMessage`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

#[async_trait]
impl<F, Fut> ConsumerHandler for FnHandler<F>
where
    F: Fn(ConsumerMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.f)(msg.clone()).await
    }
}

/// Handler decoding the payload as UTF-8 text.
pub struct TextHandler<F> {
    f: F,
}

/// Wraps a closure taking the payload as a `String`; invalid UTF-8 is a
/// decode failure.
pub fn text_handler<F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(TextHandler { f })
}

#[async_trait]
impl<F, Fut> ConsumerHandler for TextHandler<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let text = String::from_utf8(msg.data.clone())
            .map_err(|err| HandlerError::Decode(err.to_string()))?;

        (self.f)(text).await
    }
}

/// Handler decoding the payload as JSON into `T`.
pub struct JsonHandler<T, F> {
    f: F,
    _event: PhantomData<fn() -> T>,
}

/// Wraps a closure taking the payload decoded as JSON; a payload that does
/// not decode into `T` is a decode failure.
pub fn json_handler<T, F, Fut>(f: F) -> Arc<dyn ConsumerHandler>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(JsonHandler {
        f,
        _event: PhantomData,
    })
}

#[async_trait]
impl<T, F, Fut> ConsumerHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let event = serde_json::from_slice::<T>(&msg.data)
            .map_err(|err| HandlerError::Decode(err.to_string()))?;

        (self.f)(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn message(data: &[u8]) -> ConsumerMessage {
        ConsumerMessage {
            queue: "jobs".to_owned(),
            delivery_tag: 1,
            data: data.to_vec(),
            properties: BasicProperties::default(),
        }
    }

    #[derive(Debug, Deserialize)]
    struct Order {
        id: u32,
    }

    #[tokio::test]
    async fn json_handler_decodes_payload() {
        let handler = json_handler(|order: Order| async move {
            if order.id == 42 {
                Ok(())
            } else {
                Err(HandlerError::Rejected)
            }
        });

        let ctx = Context::new();
        assert_eq!(handler.exec(&ctx, &message(br#"{"id":42}"#)).await, Ok(()));
        assert_eq!(
            handler.exec(&ctx, &message(br#"{"id":7}"#)).await,
            Err(HandlerError::Rejected)
        );
    }

    #[tokio::test]
    async fn json_handler_reports_malformed_payload() {
        let handler = json_handler(|_: Order| async { Ok(()) });

        let result = handler.exec(&Context::new(), &message(b"not json")).await;
        assert!(matches!(result, Err(HandlerError::Decode(_))));
    }

    #[tokio::test]
    async fn text_handler_rejects_invalid_utf8() {
        let handler = text_handler(|text| async move {
            assert_eq!(text, "hello");
            Ok(())
        });

        let ctx = Context::new();
        assert_eq!(handler.exec(&ctx, &message(b"hello")).await, Ok(()));
        assert!(matches!(
            handler.exec(&ctx, &message(&[0xff, 0xfe])).await,
            Err(HandlerError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn fn_handler_sees_the_whole_message() {
        let handler = handler_fn(|msg: ConsumerMessage| async move {
            assert_eq!(msg.queue, "jobs");
            assert_eq!(msg.text_lossy(), "hello");
            Ok(())
        });

        assert_eq!(handler.exec(&Context::new(), &message(b"hello")).await, Ok(()));
    }
}

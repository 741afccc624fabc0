// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::BasicProperties;
use parking_lot::Mutex;
use rabbitmq_resilience::{
    config::BrokerOptions,
    errors::AmqpError,
    exchange::ExchangeSpec,
    plugin::Plugin,
    queue::QueueSpec,
    transport::{
        BrokerChannel, Delivery, DeliveryStream, FaultNotifier, FaultSignal, Transport,
    },
};
use std::{
    future::Future,
    io::Write,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// A broker call, tagged with the id of the connection it was issued on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(usize),
    DeclareExchange(usize, String),
    DeclareQueue(usize, String),
    Bind(usize, String, String, String),
    Consume(usize, String, String),
    Ack(usize, u64),
    Nack(usize, u64, bool),
    Publish(usize, String, String, Vec<u8>),
    Close(usize),
}

pub struct FakeBroker {
    reachable: AtomicBool,
    hanging: AtomicBool,
    attempts: AtomicU32,
    calls: Arc<Mutex<Vec<Call>>>,
    connections: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            reachable: AtomicBool::new(true),
            hanging: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn unreachable() -> Arc<FakeBroker> {
        let broker = FakeBroker::new();
        broker.set_reachable(false);
        broker
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Makes connect calls never complete.
    pub fn set_hanging(&self, hanging: bool) {
        self.hanging.store(hanging, Ordering::SeqCst);
    }

    /// Number of connect calls, successful or not.
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls issued on connection `id`.
    pub fn calls_on(&self, id: usize) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call_connection(call) == id)
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn latest(&self) -> Option<Arc<FakeChannel>> {
        self.connections.lock().last().cloned()
    }

    /// Kills the latest connection and reports it through every given signal.
    pub fn drop_connection(&self, signals: Vec<FaultSignal>) {
        if let Some(conn) = self.latest() {
            conn.kill();
            for signal in signals {
                conn.notifier.notify(signal);
            }
        }
    }

    /// Delivers `body` to a consumer of `queue` on the latest connection.
    pub fn deliver(&self, queue: &str, delivery_tag: u64, body: &str) -> bool {
        self.latest()
            .map(|conn| conn.deliver(queue, delivery_tag, body))
            .unwrap_or(false)
    }
}

fn call_connection(call: &Call) -> usize {
    match call {
        Call::Connect(id)
        | Call::DeclareExchange(id, _)
        | Call::DeclareQueue(id, _)
        | Call::Bind(id, _, _, _)
        | Call::Consume(id, _, _)
        | Call::Ack(id, _)
        | Call::Nack(id, _, _)
        | Call::Publish(id, _, _, _)
        | Call::Close(id) => *id,
    }
}

#[async_trait]
impl Transport for FakeBroker {
    async fn connect(
        &self,
        _options: &BrokerOptions,
        faults: FaultNotifier,
    ) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if !self.reachable.load(Ordering::SeqCst) {
            return Err(AmqpError::ConnectionError);
        }

        let mut connections = self.connections.lock();
        let id = connections.len() + 1;
        let conn = Arc::new(FakeChannel {
            id,
            open: AtomicBool::new(true),
            notifier: faults,
            calls: self.calls.clone(),
            consumers: Mutex::new(Vec::new()),
        });
        connections.push(conn.clone());
        self.calls.lock().push(Call::Connect(id));

        Ok(conn)
    }
}

struct FakeConsumer {
    queue: String,
    tx: mpsc::UnboundedSender<Result<Delivery, AmqpError>>,
}

pub struct FakeChannel {
    pub id: usize,
    open: AtomicBool,
    notifier: FaultNotifier,
    calls: Arc<Mutex<Vec<Call>>>,
    consumers: Mutex<Vec<FakeConsumer>>,
}

impl FakeChannel {
    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn kill(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.consumers.lock().clear();
    }

    pub fn generation(&self) -> u64 {
        self.notifier.generation()
    }

    fn deliver(&self, queue: &str, delivery_tag: u64, body: &str) -> bool {
        let consumers = self.consumers.lock();
        let Some(consumer) = consumers.iter().find(|c| c.queue == queue) else {
            return false;
        };

        consumer
            .tx
            .send(Ok(Delivery {
                delivery_tag,
                data: body.as_bytes().to_vec(),
                properties: BasicProperties::default(),
            }))
            .is_ok()
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError)
        }
    }
}

#[async_trait]
impl BrokerChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.record(Call::DeclareExchange(self.id, spec.name.clone()));
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.record(Call::DeclareQueue(self.id, spec.name.clone()));
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.record(Call::Bind(
            self.id,
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        self.record(Call::Consume(self.id, queue.to_owned(), consumer_tag.to_owned()));

        let (tx, rx) = mpsc::unbounded_channel();
        self.consumers.lock().push(FakeConsumer {
            queue: queue.to_owned(),
            tx,
        });

        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::AckMessageError)?;
        self.record(Call::Ack(self.id, delivery_tag));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::NackMessageError)?;
        self.record(Call::Nack(self.id, delivery_tag, requeue));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open().map_err(|_| AmqpError::PublishingError)?;
        self.record(Call::Publish(
            self.id,
            exchange.to_owned(),
            routing_key.to_owned(),
            payload.to_vec(),
        ));
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.kill();
        self.record(Call::Close(self.id));
        Ok(())
    }
}

/// Plugin recording its hook invocations.
#[derive(Default)]
pub struct RecordingPlugin {
    pub hooks: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_started(&self, _cancel: &CancellationToken) -> Result<(), AmqpError> {
        self.hooks.lock().push("started");
        Ok(())
    }

    async fn on_connected(&self, _cancel: &CancellationToken) -> Result<(), AmqpError> {
        self.hooks.lock().push("connected");
        Ok(())
    }
}

/// Polls `condition` until it holds; panics after two minutes.
pub async fn wait_until<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);

    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Runs `fut`, returning its output together with everything logged meanwhile.
pub async fn with_captured_logs<F: Future>(fut: F) -> (F::Output, String) {
    let captured = Captured::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .finish();

    let guard = tracing::subscriber::set_default(subscriber);
    let output = fut.await;
    drop(guard);

    (output, captured.text())
}

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

/// Minimal management API answering every request with `status` and `body`.
pub async fn management_api(status: &'static str, body: &'static str) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];

            loop {
                let n = socket.read(&mut buf).await.unwrap_or(0);
                raw.extend_from_slice(&buf[..n]);
                if n == 0 || request_complete(&raw) {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });

    (port, handle)
}

fn request_complete(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let Some(end) = text.find("\r\n\r\n") else {
        return false;
    };

    let length = text[..end]
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .and_then(|v| v.trim().parse::<usize>().ok())
        })
        .unwrap_or(0);

    raw.len() >= end + 4 + length
}

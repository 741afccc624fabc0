// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Connection Manager
//!
//! Owns the single logical broker connection on behalf of the host: connects,
//! installs the topology, notifies plugins, starts one consumer per handler
//! registration and, on any fault signal, reconnects with capped exponential
//! backoff and replays all of it.
//!
//! ## State machine
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
//!                     |                           |
//!                     +--------> Failed <---------+
//! ```
//!
//! Connect and reconnect sequences run under the reconnect lock. Consumers
//! are started and stopped under a separate activation lock, held only for
//! that step, so handler registration never waits out a retry loop. Fault
//! signals are tagged with the connection generation they came from; a
//! signal from a connection older than the latest attempt is ignored, and any
//! number of concurrent signals run at most one reconnect sequence.
//!
//! [`ConnectionManager::shutdown`] interrupts any retry loop in progress.
//! Dropping the last handle without calling it tears the connection down as
//! well.

use crate::{
    backoff::RetryBudget,
    channel::LapinTransport,
    config::BrokerOptions,
    dispatcher::{Dispatch, HandlerRegistration},
    errors::AmqpError,
    handler::ConsumerHandler,
    plugin::{self, Plugin},
    publisher::RabbitMQPublisher,
    topology::Topology,
    transport::{
        BrokerChannel, ChannelSlot, Fault, FaultNotifier, FaultSignal, LiveChannel, Transport,
    },
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

const EVENTS_CAPACITY: usize = 64;

/// Lifecycle state of the managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; the process is expected to restart.
    Failed,
}

/// Notifications broadcast to observers of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The first connect completed and consumers are running.
    Connected,
    /// Topology declarations were committed on a new connection.
    TopologyReady,
    /// A fault signal was received from the live connection.
    ConnectionLost(FaultSignal),
    /// A reconnect completed and consumers are running again.
    Reconnected,
    /// Connecting was given up; carries the fatal error.
    Failed(AmqpError),
}

/// A consumer currently attached to the live channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub queue: String,
    pub consumer_tag: String,
    pub generation: u64,
}

struct ActiveConsumer {
    queue: String,
    generation: u64,
    task: JoinHandle<()>,
}

struct Inner {
    options: BrokerOptions,
    transport: Arc<dyn Transport>,
    topology: Topology,
    plugins: Vec<Arc<dyn Plugin>>,
    registrations: Mutex<Vec<HandlerRegistration>>,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
    channels: ChannelSlot,
    state: watch::Sender<ConnectionState>,
    reconnect_lock: tokio::sync::Mutex<()>,
    activation: tokio::sync::Mutex<()>,
    generation: AtomicU64,
    faults_tx: mpsc::UnboundedSender<Fault>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<Fault>>>,
    events: broadcast::Sender<ConnectionEvent>,
    /// Cancelled by shutdown or when the last handle is dropped.
    closing: CancellationToken,
    reconnects: AtomicUsize,
    fatal: Mutex<Option<AmqpError>>,
    span: Span,
}

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    options: BrokerOptions,
    transport: Option<Arc<dyn Transport>>,
    topology: Topology,
    plugins: Vec<Arc<dyn Plugin>>,
    span: Option<Span>,
}

impl ConnectionManagerBuilder {
    /// Overrides the transport; defaults to [`LapinTransport`].
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Topology installed on every connect.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Appends a plugin; plugins are notified in the order they were added.
    pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    /// Span every log event of the manager is recorded in.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> ConnectionManager {
        let span = self.span.unwrap_or_else(|| {
            info_span!("rabbitmq", host = %self.options.host, port = self.options.port)
        });
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(LapinTransport::default()));
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        let inner = Arc::new(Inner {
                options: self.options,
                transport,
                topology: self.topology,
                plugins: self.plugins,
                registrations: Mutex::new(Vec::new()),
                consumers: Mutex::new(HashMap::new()),
                channels: ChannelSlot::default(),
                state: watch::Sender::new(ConnectionState::Disconnected),
                reconnect_lock: tokio::sync::Mutex::new(()),
                activation: tokio::sync::Mutex::new(()),
                generation: AtomicU64::new(0),
                faults_tx,
                faults_rx: Mutex::new(Some(faults_rx)),
                events,
                closing: CancellationToken::new(),
                reconnects: AtomicUsize::new(0),
                fatal: Mutex::new(None),
                span,
        });

        ConnectionManager {
            _lifetime: Arc::new(Lifetime {
                inner: inner.clone(),
            }),
            inner,
        }
    }
}

/// Resilient connection to a RabbitMQ broker.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
    _lifetime: Arc<Lifetime>,
}

/// Shared by all handles; tears the manager down when the last one goes.
struct Lifetime {
    inner: Arc<Inner>,
}

impl Drop for Lifetime {
    fn drop(&mut self) {
        let _entered = self.inner.span.enter();
        self.inner.teardown();
    }
}

impl ConnectionManager {
    pub fn builder(options: BrokerOptions) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            options,
            transport: None,
            topology: Topology::default(),
            plugins: Vec::new(),
            span: None,
        }
    }

    /// Connects, installs the topology, notifies plugins and starts consumers.
    ///
    /// The first attempt is made immediately; after that up to
    /// `max_reconnect_retry_count` retries follow with backoff. `cancel` aborts
    /// only this initial loop.
    pub async fn start(&self, cancel: CancellationToken) -> Result<(), AmqpError> {
        let span = self.inner.span.clone();
        self.inner.clone().start(cancel).instrument(span).await
    }

    /// Registers a handler for `queue`.
    ///
    /// When already connected the consumer is started right away, otherwise
    /// it starts with the next successful connect.
    pub async fn register_handler(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let span = self.inner.span.clone();
        self.inner
            .register_handler(queue, handler)
            .instrument(span)
            .await
    }

    /// Stops consumers and closes the connection. A connect or reconnect in
    /// progress is abandoned. Later fault signals are ignored and the manager
    /// cannot be started again.
    pub async fn shutdown(&self) -> Result<(), AmqpError> {
        let span = self.inner.span.clone();
        self.inner.shutdown().instrument(span).await
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver observing every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves with the fatal error once the manager has failed.
    pub async fn failure(&self) -> AmqpError {
        let mut state = self.inner.state.subscribe();
        // the sender lives as long as `self`
        let _ = state
            .wait_for(|state| *state == ConnectionState::Failed)
            .await;

        self.inner
            .fatal
            .lock()
            .clone()
            .unwrap_or(AmqpError::InternalError)
    }

    /// Number of reconnect sequences run so far.
    pub fn reconnect_count(&self) -> usize {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    /// Consumers attached to the live channel, ordered by consumer tag.
    pub fn active_consumers(&self) -> Vec<ConsumerInfo> {
        let mut active: Vec<ConsumerInfo> = self
            .inner
            .consumers
            .lock()
            .iter()
            .filter(|(_, consumer)| !consumer.task.is_finished())
            .map(|(tag, consumer)| ConsumerInfo {
                queue: consumer.queue.clone(),
                consumer_tag: tag.clone(),
                generation: consumer.generation,
            })
            .collect();

        active.sort_by(|a, b| a.consumer_tag.cmp(&b.consumer_tag));
        active
    }

    /// Handle to the live channel.
    pub fn channels(&self) -> ChannelSlot {
        self.inner.channels.clone()
    }

    /// Publisher over the live channel.
    pub fn publisher(&self) -> RabbitMQPublisher {
        RabbitMQPublisher::new(self.inner.channels.clone())
    }
}

fn consumer_tag(queue: &str, index: usize) -> String {
    format!("{queue}-{index}")
}

fn close_in_background(channel: Arc<dyn BrokerChannel>) {
    tokio::spawn(
        async move {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "failure to close the replaced connection");
            }
        }
        .in_current_span(),
    );
}

impl Inner {
    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state changed");
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn fail(&self, err: AmqpError) -> AmqpError {
        *self.fatal.lock() = Some(err.clone());
        self.set_state(ConnectionState::Failed);
        self.emit(ConnectionEvent::Failed(err.clone()));
        err
    }

    async fn start(self: Arc<Self>, cancel: CancellationToken) -> Result<(), AmqpError> {
        let _guard = self.reconnect_lock.lock().await;

        if self.closing.is_cancelled() || self.current_state() != ConnectionState::Disconnected {
            return Err(AmqpError::AlreadyStarted);
        }

        let cancel = self.link(cancel);
        let _unlink = cancel.clone().drop_guard();

        self.spawn_supervisor();
        self.set_state(ConnectionState::Connecting);

        let live = match self.connect_with_retry(&cancel, true).await {
            Ok(live) => live,
            Err(AmqpError::Cancelled) => {
                info!("connect cancelled");
                self.set_state(ConnectionState::Disconnected);
                return Err(AmqpError::Cancelled);
            }
            Err(err) => {
                error!(error = %err, "Failed to connect to RabbitMQ");
                return Err(self.fail(err));
            }
        };

        self.channels.replace(Some(live.clone()));
        self.emit(ConnectionEvent::TopologyReady);

        if let Err(err) = self.activate(&cancel, &live).await {
            self.stop_consumers();
            self.channels.replace(None);
            if let Err(close_err) = live.channel.close().await {
                debug!(error = %close_err, "failure to close the connection");
            }

            if self.closing.is_cancelled() {
                info!("start abandoned, manager closed");
                return Err(AmqpError::Cancelled);
            }
            error!(error = %err, "failure to start, closing the connection");
            return Err(self.fail(err));
        }

        info!("Successfully connected to RabbitMQ");
        self.emit(ConnectionEvent::Connected);

        Ok(())
    }

    async fn activate(&self, cancel: &CancellationToken, live: &LiveChannel) -> Result<(), AmqpError> {
        plugin::notify_started(&self.plugins, cancel).await?;
        plugin::notify_connected(&self.plugins, cancel).await?;

        let _activation = self.activation.lock().await;
        self.activate_consumers(live).await?;
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Token cancelled by either `host` or [`Inner::closing`]. The relay task
    /// ends once the returned token is cancelled.
    fn link(&self, host: CancellationToken) -> CancellationToken {
        let linked = self.closing.child_token();
        if host.is_cancelled() {
            linked.cancel();
        }
        let relay = linked.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = host.cancelled() => relay.cancel(),
                _ = relay.cancelled() => {}
            }
        });

        linked
    }

    /// Spawns the task turning fault signals into reconnects; runs once.
    fn spawn_supervisor(self: &Arc<Self>) {
        let Some(mut faults) = self.faults_rx.lock().take() else {
            return;
        };
        let manager = Arc::downgrade(self);
        let closing = self.closing.clone();

        tokio::spawn(
            async move {
                loop {
                    let fault = tokio::select! {
                        _ = closing.cancelled() => break,
                        fault = faults.recv() => fault,
                    };
                    let Some(fault) = fault else {
                        break;
                    };
                    let Some(inner) = manager.upgrade() else {
                        break;
                    };
                    inner.on_fault(fault);
                }
                debug!("fault supervisor stopped");
            }
            .instrument(self.span.clone()),
        );
    }

    fn on_fault(self: Arc<Self>, fault: Fault) {
        if self.closing.is_cancelled() {
            debug!(signal = %fault.signal, "ignoring fault after shutdown");
            return;
        }

        if fault.generation < self.generation.load(Ordering::SeqCst) {
            debug!(
                signal = %fault.signal,
                generation = fault.generation,
                "ignoring fault from a replaced connection"
            );
            return;
        }

        match &fault.signal {
            FaultSignal::ConnectionShutdown(reason) => {
                warn!(reason = %reason, "connection shutdown")
            }
            FaultSignal::CallbackException(reason) => {
                error!(reason = %reason, "callback exception")
            }
            FaultSignal::ConnectionBlocked(reason) => {
                warn!(reason = %reason, "connection blocked")
            }
        }

        self.emit(ConnectionEvent::ConnectionLost(fault.signal));

        let span = self.span.clone();
        tokio::spawn(self.reconnect().instrument(span));
    }

    async fn reconnect(self: Arc<Self>) {
        let _guard = self.reconnect_lock.lock().await;

        if self.closing.is_cancelled() {
            return;
        }

        match self.current_state() {
            ConnectionState::Connected => {
                let open = self
                    .channels
                    .current()
                    .is_some_and(|live| live.channel.is_open());
                if open {
                    debug!("already connected, skipping reconnect");
                    return;
                }
            }
            ConnectionState::Reconnecting => {}
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Failed => return,
        }

        {
            let _activation = self.activation.lock().await;
            self.set_state(ConnectionState::Reconnecting);
            self.stop_consumers();
        }
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        info!("Reconnecting to RabbitMQ...");

        self.discard_channel();

        let live = match self.connect_with_retry(&self.closing, false).await {
            Ok(live) => live,
            Err(AmqpError::Cancelled) => {
                info!("reconnect abandoned, manager closed");
                return;
            }
            Err(err) => {
                if let AmqpError::ConnectionFailure { attempts } = &err {
                    error!("Failed to reconnect after {attempts} attempts. Giving up.");
                }
                self.fail(err);
                return;
            }
        };

        self.channels.replace(Some(live.clone()));
        if self.closing.is_cancelled() {
            self.discard_channel();
            return;
        }
        self.emit(ConnectionEvent::TopologyReady);

        if let Err(err) = plugin::notify_connected(&self.plugins, &self.closing).await {
            self.discard_channel();
            if self.closing.is_cancelled() {
                return;
            }
            error!(error = %err, "plugin failure after reconnect");
            self.fail(err);
            return;
        }

        let activated = {
            let _activation = self.activation.lock().await;
            let result = self.activate_consumers(&live).await;
            if result.is_ok() {
                self.set_state(ConnectionState::Connected);
            }
            result
        };

        if let Err(err) = activated {
            warn!(error = %err, "failure to restart consumers, reconnecting again");
            self.stop_consumers();
            self.discard_channel();
            FaultNotifier::new(live.generation, self.faults_tx.clone())
                .notify(FaultSignal::CallbackException(err.to_string()));
            return;
        }

        if self.closing.is_cancelled() {
            self.stop_consumers();
            self.discard_channel();
            return;
        }

        info!("Successfully reconnected to RabbitMQ");
        self.emit(ConnectionEvent::Reconnected);
    }

    async fn connect_with_retry(
        &self,
        cancel: &CancellationToken,
        immediate: bool,
    ) -> Result<LiveChannel, AmqpError> {
        let mut budget = RetryBudget::new(self.options.max_reconnect_retry_count);

        if immediate {
            match self.attempt(cancel).await {
                Err(AmqpError::Cancelled) => return Err(AmqpError::Cancelled),
                Err(err) => warn!(error = %err, "Failed to connect to RabbitMQ, retrying"),
                ok => return ok,
            }

            if budget.has_remaining() {
                pause(cancel, budget.next_delay()).await?;
            }
        }

        while budget.has_remaining() {
            let attempt = budget.attempts() + 1;

            match self.attempt(cancel).await {
                Err(AmqpError::Cancelled) => return Err(AmqpError::Cancelled),
                Err(err) => {
                    warn!(attempt, error = %err, "Reconnection attempt {attempt} failed");

                    let Some(delay) = budget.fail() else {
                        break;
                    };
                    pause(cancel, delay).await?;
                }
                ok => return ok,
            }
        }

        Err(AmqpError::ConnectionFailure {
            attempts: budget.attempts(),
        })
    }

    async fn attempt(&self, cancel: &CancellationToken) -> Result<LiveChannel, AmqpError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AmqpError::Cancelled),
            result = self.connect_once() => result,
        }
    }

    /// One connect attempt: open the connection and install the topology.
    async fn connect_once(&self) -> Result<LiveChannel, AmqpError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let notifier = FaultNotifier::new(generation, self.faults_tx.clone());

        let connecting = self.transport.connect(&self.options, notifier);
        let channel = time::timeout(self.options.network_recovery_interval(), connecting)
            .await
            .map_err(|_| {
                warn!("connect attempt timed out");
                AmqpError::ConnectionError
            })??;

        if let Err(err) = self.topology.install(channel.as_ref()).await {
            close_in_background(channel);
            return Err(err);
        }

        debug!(generation, "connection established");
        Ok(LiveChannel {
            generation,
            channel,
        })
    }

    async fn activate_consumers(&self, live: &LiveChannel) -> Result<(), AmqpError> {
        let registrations = self.registrations.lock().clone();

        for (index, registration) in registrations.iter().enumerate() {
            self.activate_consumer(live, index, registration).await?;
        }

        Ok(())
    }

    async fn activate_consumer(
        &self,
        live: &LiveChannel,
        index: usize,
        registration: &HandlerRegistration,
    ) -> Result<(), AmqpError> {
        let tag = consumer_tag(&registration.queue, index);
        let stream = live.channel.consume(&registration.queue, &tag).await?;

        let dispatch = Arc::new(Dispatch {
            queue: registration.queue.clone(),
            generation: live.generation,
            handler: registration.handler.clone(),
            channels: self.channels.clone(),
        });
        let task = tokio::spawn(dispatch.run(stream).instrument(self.span.clone()));

        let previous = self.consumers.lock().insert(
            tag.clone(),
            ActiveConsumer {
                queue: registration.queue.clone(),
                generation: live.generation,
                task,
            },
        );
        if let Some(previous) = previous {
            previous.task.abort();
        }

        info!(queue = %registration.queue, consumer_tag = %tag, "consumer started");
        Ok(())
    }

    /// Empties the slot and closes the channel it held, if any.
    fn discard_channel(&self) {
        if let Some(stale) = self.channels.replace(None) {
            close_in_background(stale.channel);
        }
    }

    fn stop_consumers(&self) {
        for (tag, consumer) in self.consumers.lock().drain() {
            consumer.task.abort();
            debug!(consumer_tag = %tag, "consumer stopped");
        }
    }

    async fn register_handler(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        let _activation = self.activation.lock().await;

        let registration = HandlerRegistration {
            queue: queue.to_owned(),
            handler,
        };
        let index = {
            let mut registrations = self.registrations.lock();
            registrations.push(registration.clone());
            registrations.len() - 1
        };

        if self.current_state() != ConnectionState::Connected {
            debug!(queue, "handler registered, consumer deferred until connected");
            return Ok(());
        }

        match self.channels.current() {
            Some(live) => self.activate_consumer(&live, index, &registration).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&self) -> Result<(), AmqpError> {
        self.closing.cancel();

        let _guard = self.reconnect_lock.lock().await;
        let _activation = self.activation.lock().await;
        self.stop_consumers();

        let result = match self.channels.replace(None) {
            Some(live) => live.channel.close().await,
            None => Ok(()),
        };

        self.set_state(ConnectionState::Disconnected);
        info!("connection manager shut down");

        result
    }

    /// Synchronous teardown for when no handle is left to call `shutdown`.
    fn teardown(&self) {
        if self.closing.is_cancelled() {
            return;
        }

        self.closing.cancel();
        self.stop_consumers();

        if let Some(live) = self.channels.replace(None) {
            if Handle::try_current().is_ok() {
                close_in_background(live.channel);
            } else {
                warn!("no runtime to close the connection on, dropping it");
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("connection manager dropped, connection closed");
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
async fn pause(cancel: &CancellationToken, delay: Duration) -> Result<(), AmqpError> {
    debug!(delay_secs = delay.as_secs(), "waiting before the next attempt");

    tokio::select! {
        _ = cancel.cancelled() => Err(AmqpError::Cancelled),
        _ = time::sleep(delay) => Ok(()),
    }
}

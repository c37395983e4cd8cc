//! STOMP connection lifecycle over a pluggable transport.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! Connection (Clone) ──▶ Shared ──▶ link: outbound queue ──▶ I/O task ──▶ Transport
//!                          │                                    │
//!                          └──────── Routing ◀──────────────────┘
//!                                  (state, subscriptions, events)
//! ```
//!
//! LIFECYCLE
//! =========
//! 1. `connect()` opens a transport, sends CONNECT and waits for CONNECTED.
//! 2. One I/O task per live socket selects over the outbound queue, inbound
//!    frames, the heart-beat ticker and the incoming-silence watchdog.
//! 3. Every SEND, SUBSCRIBE and DISCONNECT goes through the same unbounded
//!    queue, so frames leave in the order they were enqueued.
//! 4. `disconnect()` enqueues DISCONNECT, then waits for the task to close the
//!    socket. Dropping the last handle does the same without waiting.
//!
//! Each socket gets a generation number. An I/O task only marks the handle
//! `Disconnected` while its own generation is still current, and `Connected`
//! is published before the task is spawned.
//!
//! The I/O task only holds `Routing`, never `Shared`, so dropping every
//! `Connection` handle always reaches `Shared::drop`.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use frames::{CodecError, Command, Frame, HeartBeat, Negotiated, decode_frames, encode_frame, negotiate};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::alert::ErrorCode;
use crate::config::{ChatConfig, RetryPolicy};
use crate::transport::{Connector, Transport, TransportError};

const EVENT_CAPACITY: usize = 64;
const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("socket url is empty")]
    EmptyUrl,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("stomp protocol error: {0}")]
    Protocol(#[from] CodecError),
    #[error("broker rejected connection: {message}")]
    Broker { message: String },
    #[error("timed out after {0:?} waiting for CONNECTED")]
    Timeout(Duration),
    #[error("socket closed during handshake")]
    Closed,
    #[error("not connected")]
    NotConnected,
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ErrorCode for ConnectionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyUrl => "E_EMPTY_URL",
            Self::Transport(e) => e.error_code(),
            Self::Protocol(_) => "E_STOMP_PROTOCOL",
            Self::Broker { .. } => "E_BROKER_ERROR",
            Self::Timeout(_) => "E_CONNECT_TIMEOUT",
            Self::Closed => "E_TRANSPORT_CLOSED",
            Self::NotConnected => "E_NOT_CONNECTED",
            Self::Encode(_) => "E_ENCODE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.retryable(),
            Self::Timeout(_) | Self::Closed => true,
            _ => false,
        }
    }
}

// =============================================================================
// PUBLIC TYPES
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Out-of-band notifications from a live connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    /// Broker ERROR frame or transport failure while connected.
    Error { message: String, details: String },
    /// The socket is gone; the handle may `connect()` again.
    Closed,
}

/// Per-connection STOMP settings.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub heartbeat: HeartBeat,
    pub connect_timeout: Option<Duration>,
    pub auth_token: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&ChatConfig::default())
    }
}

impl ConnectOptions {
    #[must_use]
    pub fn from_config(config: &ChatConfig) -> Self {
        let millis = |d: Duration| u64::try_from(d.as_millis()).unwrap_or(u64::MAX);
        Self {
            heartbeat: HeartBeat::new(millis(config.heartbeat_outgoing), millis(config.heartbeat_incoming)),
            connect_timeout: config.connect_timeout,
            auth_token: config.auth_token.clone(),
        }
    }
}

// =============================================================================
// MANAGER
// =============================================================================

/// Factory for [`Connection`]s sharing one connector and one live-socket count.
#[derive(Clone)]
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    active: Arc<AtomicUsize>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, options: ConnectOptions) -> Self {
        Self { connector, options, active: Arc::new(AtomicUsize::new(0)) }
    }

    /// A handle for `url` in the `Disconnected` state.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::EmptyUrl`] for a blank URL.
    pub fn connection(&self, url: &str) -> Result<Connection, ConnectionError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ConnectionError::EmptyUrl);
        }

        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Connection {
            shared: Arc::new(Shared {
                url: url.to_owned(),
                connector: Arc::clone(&self.connector),
                options: self.options.clone(),
                active: Arc::clone(&self.active),
                routing: Arc::new(Routing {
                    state,
                    generation: AtomicU64::new(0),
                    subscriptions: Mutex::new(Vec::new()),
                    events,
                }),
                link: Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                next_subscription: AtomicU64::new(0),
            }),
        })
    }

    /// Open and connect in one step.
    ///
    /// # Errors
    ///
    /// Any [`ConnectionError`] from the handshake.
    pub async fn connect(&self, url: &str) -> Result<Connection, ConnectionError> {
        let connection = self.connection(url)?;
        connection.connect().await?;
        Ok(connection)
    }

    /// Number of sockets currently held open by connections from this manager.
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

/// Cheap-to-clone handle to one STOMP connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    url: String,
    connector: Arc<dyn Connector>,
    options: ConnectOptions,
    active: Arc<AtomicUsize>,
    routing: Arc<Routing>,
    link: Mutex<Option<Link>>,
    connect_lock: tokio::sync::Mutex<()>,
    next_subscription: AtomicU64,
}

struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    task: JoinHandle<()>,
}

enum Outbound {
    Frame(String),
    Close,
}

struct Routing {
    state: watch::Sender<ConnectionState>,
    generation: AtomicU64,
    subscriptions: Mutex<Vec<SubscriptionEntry>>,
    events: broadcast::Sender<ConnectionEvent>,
}

struct SubscriptionEntry {
    id: String,
    destination: String,
    sender: mpsc::UnboundedSender<String>,
}

impl Connection {
    #[must_use]
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.routing.state.borrow()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.routing.state.subscribe()
    }

    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.routing.events.subscribe()
    }

    /// Handshake with the broker. A no-op when already connected.
    ///
    /// Existing subscriptions are re-issued after CONNECTED.
    ///
    /// # Errors
    ///
    /// Transport, protocol, broker-rejection and timeout errors. The handle is
    /// left `Disconnected` and may be connected again.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let _guard = self.shared.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let shared = &self.shared;
        shared.routing.state.send_replace(ConnectionState::Connecting);
        debug!(url = %shared.url, "stomp: connecting");

        let handshake = match shared.options.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, self.handshake())
                .await
                .unwrap_or(Err(ConnectionError::Timeout(limit))),
            None => self.handshake().await,
        };
        let (transport, negotiated) = match handshake {
            Ok(ok) => ok,
            Err(e) => {
                shared.routing.state.send_replace(ConnectionState::Disconnected);
                warn!(url = %shared.url, error = %e, "stomp: connect failed");
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let subscriptions = lock(&shared.routing.subscriptions);
        for entry in subscriptions.iter() {
            let _ = tx.send(Outbound::Frame(encode_frame(&subscribe_frame(&entry.id, &entry.destination))));
        }

        // State and link are both in place before the task can observe a close.
        let mut link = lock(&shared.link);
        let generation = shared.routing.generation.fetch_add(1, Ordering::SeqCst) + 1;
        shared.active.fetch_add(1, Ordering::SeqCst);
        shared.routing.state.send_replace(ConnectionState::Connected);
        let _ = shared.routing.events.send(ConnectionEvent::Connected);
        let task = tokio::spawn(run_io(
            transport,
            rx,
            Arc::clone(&shared.routing),
            negotiated,
            generation,
            Arc::clone(&shared.active),
        ));
        if let Some(stale) = link.replace(Link { outbound: tx, task }) {
            let _ = stale.outbound.send(Outbound::Close);
        }
        drop(link);
        drop(subscriptions);

        info!(
            url = %shared.url,
            send_every = ?negotiated.send_every,
            expect_every = ?negotiated.expect_every,
            "stomp: connected"
        );
        Ok(())
    }

    /// [`Connection::connect`] with backoff between retryable failures.
    ///
    /// # Errors
    ///
    /// The last error once attempts are exhausted, or the first non-retryable one.
    pub async fn connect_with_retry(&self, policy: RetryPolicy) -> Result<(), ConnectionError> {
        let mut attempt = 1;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < policy.max_attempts && e.retryable() => {
                    let backoff = policy.backoff_after(attempt);
                    warn!(
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "stomp: retrying connect"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handshake(&self) -> Result<(Box<dyn Transport>, Negotiated), ConnectionError> {
        let shared = &self.shared;
        let mut transport = shared.connector.open(&shared.url).await?;

        let mut connect = Frame::new(Command::Connect)
            .with_header("accept-version", ACCEPT_VERSION)
            .with_header("host", host_of(&shared.url))
            .with_header("heart-beat", shared.options.heartbeat.header_value());
        if let Some(token) = &shared.options.auth_token {
            connect = connect.with_header("Authorization", format!("Bearer {token}"));
        }
        transport.send(encode_frame(&connect)).await?;

        loop {
            let text = transport.recv().await.ok_or(ConnectionError::Closed)??;
            for frame in decode_frames(&text)? {
                match frame.command {
                    Command::Connected => {
                        let server = HeartBeat::parse(frame.header("heart-beat").unwrap_or("0,0"));
                        return Ok((transport, negotiate(shared.options.heartbeat, server)));
                    }
                    Command::Error => {
                        let message = frame.header("message").unwrap_or(&frame.body).to_owned();
                        return Err(ConnectionError::Broker { message });
                    }
                    other => debug!(command = %other, "stomp: ignoring frame before CONNECTED"),
                }
            }
        }
    }

    /// Register a receiver for `destination`.
    ///
    /// SUBSCRIBE is sent now when connected, otherwise on the next connect.
    /// Dropping the returned [`Subscription`] unsubscribes.
    #[must_use]
    pub fn subscribe(&self, destination: &str) -> Subscription {
        let id = format!("sub-{}", self.shared.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut subscriptions = lock(&self.shared.routing.subscriptions);
        subscriptions.push(SubscriptionEntry {
            id: id.clone(),
            destination: destination.to_owned(),
            sender,
        });
        if self.shared.send_frame(&subscribe_frame(&id, destination)).is_err() {
            debug!(%destination, "stomp: subscribe deferred until connected");
        }
        drop(subscriptions);

        Subscription {
            id,
            destination: destination.to_owned(),
            receiver,
            connection: Arc::downgrade(&self.shared),
        }
    }

    /// Send a JSON body to `destination`. Fire-and-forget.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotConnected`] when there is no live socket; the
    /// frame is not queued.
    pub fn publish(&self, destination: &str, payload: &impl Serialize) -> Result<(), ConnectionError> {
        let body = serde_json::to_string(payload)?;
        let frame = Frame::new(Command::Send)
            .with_header("destination", destination)
            .with_header("content-type", "application/json")
            .with_body(body);

        self.shared
            .send_frame(&frame)
            .inspect_err(|e| warn!(%destination, error = %e, "stomp: publish skipped"))
    }

    /// Send DISCONNECT and wait for the socket to close. Idempotent.
    pub async fn disconnect(&self) {
        let link = lock(&self.shared.link).take();
        let Some(link) = link else {
            return;
        };
        let _ = link.outbound.send(Outbound::Close);
        if let Err(e) = link.task.await {
            warn!(error = %e, "stomp: io task ended abnormally");
        }
        debug!(url = %self.shared.url, "stomp: disconnected");
    }

    /// Enqueue DISCONNECT without waiting. For synchronous teardown paths.
    pub fn begin_close(&self) {
        if let Some(link) = lock(&self.shared.link).take() {
            let _ = link.outbound.send(Outbound::Close);
        }
    }
}

impl Shared {
    fn send_frame(&self, frame: &Frame) -> Result<(), ConnectionError> {
        if *self.routing.state.borrow() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        let link = lock(&self.link);
        let Some(link) = link.as_ref() else {
            return Err(ConnectionError::NotConnected);
        };
        link.outbound
            .send(Outbound::Frame(encode_frame(frame)))
            .map_err(|_| ConnectionError::NotConnected)
    }

    fn unsubscribe(&self, id: &str) {
        let mut subscriptions = lock(&self.routing.subscriptions);
        subscriptions.retain(|entry| entry.id != id);
        let _ = self.send_frame(&Frame::new(Command::Unsubscribe).with_header("id", id));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(link) = link {
            let _ = link.outbound.send(Outbound::Close);
        }
    }
}

// =============================================================================
// SUBSCRIPTION
// =============================================================================

/// Receiver for MESSAGE bodies on one destination.
pub struct Subscription {
    id: String,
    destination: String,
    receiver: mpsc::UnboundedReceiver<String>,
    connection: Weak<Shared>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Next body. `None` once the connection has been dropped.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.connection.upgrade() {
            shared.unsubscribe(&self.id);
        }
    }
}

// =============================================================================
// I/O TASK
// =============================================================================

async fn run_io(
    mut transport: Box<dyn Transport>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    routing: Arc<Routing>,
    negotiated: Negotiated,
    generation: u64,
    active: Arc<AtomicUsize>,
) {
    let mut heartbeat = negotiated.send_every.map(|every| {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    // Allow one missed beat before declaring the peer dead.
    let silence_limit = negotiated.expect_every.map(|every| every * 2);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Frame(text)) => {
                    if let Err(e) = transport.send(text).await {
                        routing.report("send failed", &e);
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = transport.send(encode_frame(&Frame::new(Command::Disconnect))).await;
                    break;
                }
            },
            inbound = transport.recv() => match inbound {
                Some(Ok(text)) => {
                    last_seen = Instant::now();
                    if !routing.dispatch(&text) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    routing.report("receive failed", &e);
                    break;
                }
                None => {
                    info!("stomp: socket closed by peer");
                    break;
                }
            },
            () = tick(&mut heartbeat) => {
                if let Err(e) = transport.send("\n".to_owned()).await {
                    routing.report("heart-beat failed", &e);
                    break;
                }
            }
            () = silence(silence_limit, last_seen) => {
                warn!("stomp: no heart-beat from broker, closing");
                let _ = routing.events.send(ConnectionEvent::Error {
                    message: "heart-beat timeout".to_owned(),
                    details: String::new(),
                });
                break;
            }
        }
    }

    if let Err(e) = transport.close().await {
        debug!(error = %e, "stomp: close after shutdown");
    }
    routing.state.send_if_modified(|state| {
        let current = routing.generation.load(Ordering::SeqCst) == generation;
        if current {
            *state = ConnectionState::Disconnected;
        }
        current
    });
    active.fetch_sub(1, Ordering::SeqCst);
    let _ = routing.events.send(ConnectionEvent::Closed);
}

impl Routing {
    /// Route inbound frames. Returns `false` when the connection must end.
    fn dispatch(&self, text: &str) -> bool {
        let frames = match decode_frames(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "stomp: dropping undecodable frame");
                return true;
            }
        };

        for frame in frames {
            match frame.command {
                Command::Message => {
                    let Some(id) = frame.header("subscription").map(str::to_owned) else {
                        debug!("stomp: MESSAGE without subscription header");
                        continue;
                    };
                    let subscriptions = lock(&self.subscriptions);
                    match subscriptions.iter().find(|entry| entry.id == id) {
                        Some(entry) => {
                            let _ = entry.sender.send(frame.body);
                        }
                        None => debug!(subscription = %id, "stomp: MESSAGE for unknown subscription"),
                    }
                }
                Command::Error => {
                    let message = frame.header("message").unwrap_or("broker error").to_owned();
                    warn!(%message, "stomp: broker sent ERROR");
                    let _ = self.events.send(ConnectionEvent::Error { message, details: frame.body });
                    return false;
                }
                other => debug!(command = %other, "stomp: ignoring frame"),
            }
        }
        true
    }

    fn report(&self, context: &str, error: &TransportError) {
        warn!(error = %error, "stomp: {context}");
        let _ = self.events.send(ConnectionEvent::Error {
            message: context.to_owned(),
            details: error.to_string(),
        });
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn silence(limit: Option<Duration>, last_seen: Instant) {
    match limit {
        Some(limit) => tokio::time::sleep_until(last_seen + limit).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn subscribe_frame(id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .with_header("id", id)
        .with_header("destination", destination)
        .with_header("ack", "auto")
}

/// Authority part of a URL, for the STOMP `host` header.
fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    rest.split(['/', '?']).next().unwrap_or(rest)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;

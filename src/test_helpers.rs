//! In-memory doubles for the socket broker and the HTTP backend.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use frames::{Command, Frame, decode_frames, encode_frame, is_heartbeat};
use serde_json::Value;
use tokio::sync::{Notify, mpsc};

use crate::api::{ApiError, ChatBackend, Friend};
use crate::destination::{ADD_USER, room_topic};
use crate::transport::{Connector, Transport, TransportError};

// =============================================================================
// TIMELINE
// =============================================================================

/// Shared, ordered log of labelled events from every double.
#[derive(Clone, Default)]
pub struct Timeline(Arc<Mutex<Vec<String>>>);

impl Timeline {
    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries().iter().filter(|e| *e == entry).count()
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Serve `app` on an ephemeral local port.
pub async fn spawn_http(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server failed");
    });
    addr
}

// =============================================================================
// MEMORY TRANSPORT
// =============================================================================

pub struct MemoryTransport {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Two connected in-memory ends.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport { tx: Some(a_tx), rx: b_rx },
        MemoryTransport { tx: Some(b_tx), rx: a_rx },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        let closed = || TransportError::Closed { code: 1006, reason: "peer gone".to_owned() };
        self.tx.as_ref().ok_or_else(closed)?.send(text).map_err(|_| closed())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

// =============================================================================
// MOCK BROKER
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum BrokerRecord {
    Connect { headers: Vec<(String, String)> },
    Subscribe { id: String, destination: String },
    Unsubscribe { id: String },
    Send { destination: String, body: Value },
    Heartbeat,
    Disconnect,
    SocketClosed,
}

/// STOMP broker double implementing [`Connector`].
///
/// Client frames are handled synchronously inside `Transport::send`, so every
/// frame a connection has flushed is already recorded once `disconnect()`
/// returns.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    records: Mutex<Vec<BrokerRecord>>,
    timeline: Timeline,
    connections: Mutex<Vec<Arc<BrokerConn>>>,
    opens: AtomicUsize,
    refuse_opens: AtomicUsize,
    reject_connect: AtomicBool,
    silent: AtomicBool,
    echo_join: AtomicBool,
    server_heartbeat: Mutex<String>,
}

struct BrokerConn {
    id: usize,
    subscriptions: Mutex<Vec<(String, String)>>,
    to_client: mpsc::UnboundedSender<String>,
    next_message: AtomicU64,
}

/// Client end of a mock broker connection.
pub struct BrokerSocket {
    inner: Arc<BrokerInner>,
    conn: Arc<BrokerConn>,
    from_broker: mpsc::UnboundedReceiver<String>,
    closed: bool,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::with_timeline(Timeline::default())
    }

    pub fn with_timeline(timeline: Timeline) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                records: Mutex::new(Vec::new()),
                timeline,
                connections: Mutex::new(Vec::new()),
                opens: AtomicUsize::new(0),
                refuse_opens: AtomicUsize::new(0),
                reject_connect: AtomicBool::new(false),
                silent: AtomicBool::new(false),
                echo_join: AtomicBool::new(false),
                server_heartbeat: Mutex::new("0,0".to_owned()),
            }),
        }
    }

    /// Echo every JOIN to the room topic, like the real broker.
    pub fn echo_join(&self, enabled: bool) {
        self.inner.echo_join.store(enabled, Ordering::SeqCst);
    }

    /// Answer CONNECT with an ERROR frame.
    pub fn reject_connect(&self, enabled: bool) {
        self.inner.reject_connect.store(enabled, Ordering::SeqCst);
    }

    /// Never answer CONNECT.
    pub fn silent(&self, enabled: bool) {
        self.inner.silent.store(enabled, Ordering::SeqCst);
    }

    /// Fail the next `count` socket opens.
    pub fn refuse_opens(&self, count: usize) {
        self.inner.refuse_opens.store(count, Ordering::SeqCst);
    }

    pub fn server_heartbeat(&self, value: &str) {
        *lock(&self.inner.server_heartbeat) = value.to_owned();
    }

    pub fn opens(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    pub fn records(&self) -> Vec<BrokerRecord> {
        lock(&self.inner.records).clone()
    }

    pub fn sends_to(&self, destination: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                BrokerRecord::Send { destination: d, body } if d == destination => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn subscribed(&self, destination: &str) -> bool {
        self.records()
            .iter()
            .any(|r| matches!(r, BrokerRecord::Subscribe { destination: d, .. } if d == destination))
    }

    /// Deliver a MESSAGE to every connection subscribed to `destination`.
    pub fn deliver(&self, destination: &str, body: &str) {
        self.inner.deliver(destination, body);
    }

    /// Push raw text to every open socket.
    pub fn push_raw(&self, text: &str) {
        for conn in lock(&self.inner.connections).iter() {
            let _ = conn.to_client.send(text.to_owned());
        }
    }
}

impl BrokerInner {
    fn record(&self, record: BrokerRecord) {
        let label = match &record {
            BrokerRecord::Connect { .. } => "connect".to_owned(),
            BrokerRecord::Subscribe { destination, .. } => format!("subscribe:{destination}"),
            BrokerRecord::Unsubscribe { id } => format!("unsubscribe:{id}"),
            BrokerRecord::Send { destination, .. } => format!("send:{destination}"),
            BrokerRecord::Heartbeat => "heartbeat".to_owned(),
            BrokerRecord::Disconnect => "disconnect".to_owned(),
            BrokerRecord::SocketClosed => "socket-closed".to_owned(),
        };
        self.timeline.push(label);
        lock(&self.records).push(record);
    }

    fn deliver(&self, destination: &str, body: &str) {
        let connections = lock(&self.connections).clone();
        for conn in connections {
            let matching: Vec<String> = lock(&conn.subscriptions)
                .iter()
                .filter(|(d, _)| d == destination)
                .map(|(_, id)| id.clone())
                .collect();
            for id in matching {
                let message_id = conn.next_message.fetch_add(1, Ordering::SeqCst);
                let frame = Frame::new(Command::Message)
                    .with_header("destination", destination)
                    .with_header("subscription", id)
                    .with_header("message-id", message_id.to_string())
                    .with_body(body);
                let _ = conn.to_client.send(encode_frame(&frame));
            }
        }
    }

    /// Apply one client frame, returning the reply for that socket if any.
    fn handle(&self, conn: &BrokerConn, frame: Frame) -> Option<Frame> {
        match frame.command {
            Command::Connect | Command::Stomp => {
                self.record(BrokerRecord::Connect { headers: frame.headers.clone() });
                if self.silent.load(Ordering::SeqCst) {
                    return None;
                }
                if self.reject_connect.load(Ordering::SeqCst) {
                    return Some(
                        Frame::new(Command::Error)
                            .with_header("message", "access denied")
                            .with_body("bad credentials"),
                    );
                }
                let heartbeat = lock(&self.server_heartbeat).clone();
                return Some(
                    Frame::new(Command::Connected)
                        .with_header("version", "1.2")
                        .with_header("heart-beat", heartbeat),
                );
            }
            Command::Subscribe => {
                let id = frame.header("id").unwrap_or_default().to_owned();
                let destination = frame.header("destination").unwrap_or_default().to_owned();
                lock(&conn.subscriptions).push((destination.clone(), id.clone()));
                self.record(BrokerRecord::Subscribe { id, destination });
            }
            Command::Unsubscribe => {
                let id = frame.header("id").unwrap_or_default().to_owned();
                lock(&conn.subscriptions).retain(|(_, sub)| *sub != id);
                self.record(BrokerRecord::Unsubscribe { id });
            }
            Command::Send => {
                let destination = frame.header("destination").unwrap_or_default().to_owned();
                let body: Value = serde_json::from_str(&frame.body).unwrap_or_else(|_| Value::String(frame.body.clone()));
                let echo_room = (destination == ADD_USER && self.echo_join.load(Ordering::SeqCst))
                    .then(|| body.get("roomId").and_then(Value::as_str).map(str::to_owned))
                    .flatten();
                self.record(BrokerRecord::Send { destination, body });
                if let Some(room_id) = echo_room {
                    self.deliver(&room_topic(&room_id), &frame.body);
                }
            }
            Command::Disconnect => self.record(BrokerRecord::Disconnect),
            _ => {}
        }
        None
    }
}

#[async_trait]
impl Connector for MockBroker {
    async fn open(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let id = self.inner.opens.fetch_add(1, Ordering::SeqCst);
        let refuse = self
            .inner
            .refuse_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refuse {
            return Err(TransportError::Closed { code: 1006, reason: "refused".to_owned() });
        }

        let (to_client, from_broker) = mpsc::unbounded_channel();
        let conn = Arc::new(BrokerConn {
            id,
            subscriptions: Mutex::new(Vec::new()),
            to_client,
            next_message: AtomicU64::new(0),
        });
        lock(&self.inner.connections).push(Arc::clone(&conn));
        Ok(Box::new(BrokerSocket { inner: Arc::clone(&self.inner), conn, from_broker, closed: false }))
    }
}

#[async_trait]
impl Transport for BrokerSocket {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed { code: 1006, reason: "socket closed".to_owned() });
        }
        if is_heartbeat(&text) {
            self.inner.record(BrokerRecord::Heartbeat);
            return Ok(());
        }
        let Ok(frames) = decode_frames(&text) else {
            return Ok(());
        };
        for frame in frames {
            if let Some(reply) = self.inner.handle(&self.conn, frame) {
                let _ = self.conn.to_client.send(encode_frame(&reply));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.from_broker.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            lock(&self.inner.connections).retain(|c| c.id != self.conn.id);
            self.inner.record(BrokerRecord::SocketClosed);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MOCK BACKEND
// =============================================================================

/// [`ChatBackend`] double with scripted results.
pub struct MockBackend {
    pub history: Mutex<Result<Vec<Value>, u16>>,
    /// When set, `fetch_history` waits for a permit before returning.
    pub gate: Option<Arc<Notify>>,
    pub participants: Mutex<Result<Vec<String>, u16>>,
    pub friends: Mutex<Result<Vec<Friend>, u16>>,
    timeline: Timeline,
}

impl MockBackend {
    pub fn new(timeline: Timeline) -> Self {
        Self {
            history: Mutex::new(Ok(Vec::new())),
            gate: None,
            participants: Mutex::new(Ok(Vec::new())),
            friends: Mutex::new(Ok(Vec::new())),
            timeline,
        }
    }

    pub fn with_history(self, records: Vec<Value>) -> Self {
        *lock(&self.history) = Ok(records);
        self
    }

    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn failing_history(self, status: u16) -> Self {
        *lock(&self.history) = Err(status);
        self
    }

    pub fn with_directory(self, participants: Vec<String>, friends: Vec<Friend>) -> Self {
        *lock(&self.participants) = Ok(participants);
        *lock(&self.friends) = Ok(friends);
        self
    }
}

fn scripted<T: Clone>(slot: &Mutex<Result<T, u16>>, path: &str) -> Result<T, ApiError> {
    lock(slot)
        .clone()
        .map_err(|status| ApiError::Status { status, path: path.to_owned() })
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn fetch_history(&self, room_id: &str) -> Result<Vec<Value>, ApiError> {
        self.timeline.push("history:start");
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.timeline.push("history:done");
        scripted(&self.history, &format!("/api/chat/rooms/{room_id}/messages"))
    }

    async fn room_participants(&self, _room_id: &str) -> Result<Vec<String>, ApiError> {
        scripted(&self.participants, "/api/chat/rooms/participants")
    }

    async fn list_friends(&self, user_id: &str) -> Result<Vec<Friend>, ApiError> {
        scripted(&self.friends, &format!("/api/friends/{user_id}/friends"))
    }
}

pub fn friend(id: &str, name: &str) -> Friend {
    Friend { id: id.to_owned(), name: name.to_owned(), identifiers: vec![id.to_owned(), name.to_owned()] }
}

//! Room sessions and the LEAVE-before-DISCONNECT guarantee.
//!
//! LIFECYCLE
//! =========
//! 1. Claim the (room, user) lease so the pair cannot be opened twice.
//! 2. Connect and subscribe to the room topic and the two user queues. Live
//!    frames that arrive from here on are buffered per subscription.
//! 3. Fetch history and seed the log. A failure raises an alert and seeds
//!    an empty log.
//! 4. Publish JOIN. It never leaves before step 3 has finished.
//! 5. Start the pumps: topic bodies append to the log, queue bodies become
//!    [`SessionEvent`]s.
//! 6. `close()` or drop publishes LEAVE on the same ordered queue as
//!    DISCONNECT, so LEAVE always reaches the socket first.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alert::{Alert, ErrorCode};
use crate::api::ChatBackend;
use crate::config::ChatConfig;
use crate::connection::{Connection, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState, Subscription};
use crate::destination::{ADD_USER, LEAVE_USER, SEND_MESSAGE, USER_ERRORS, USER_INVITATIONS, room_topic};
use crate::directory::publish_once;
use crate::message::{OutboundMessage, RoomType};
use crate::stream::MessageStream;

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session for {user_id} in room {room_id} is already open")]
    AlreadyOpen { room_id: String, user_id: String },
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("message is empty")]
    EmptyMessage,
}

impl ErrorCode for SessionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AlreadyOpen { .. } => "E_SESSION_OPEN",
            Self::Connection(e) => e.error_code(),
            Self::EmptyMessage => "E_EMPTY_MESSAGE",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Connection(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

type SessionKey = (String, String);

/// Tracks which (room, user) pairs have a live session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    open: Arc<Mutex<HashSet<SessionKey>>>,
}

/// Held by a session for its lifetime; releases the pair on drop.
pub struct SessionLease {
    key: SessionKey,
    open: Arc<Mutex<HashSet<SessionKey>>>,
}

impl SessionRegistry {
    /// # Errors
    ///
    /// [`SessionError::AlreadyOpen`] when the pair already has a session.
    pub fn acquire(&self, room_id: &str, user_id: &str) -> Result<SessionLease, SessionError> {
        let key = (room_id.to_owned(), user_id.to_owned());
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if !open.insert(key.clone()) {
            return Err(SessionError::AlreadyOpen { room_id: key.0, user_id: key.1 });
        }
        Ok(SessionLease { key, open: Arc::clone(&self.open) })
    }

    #[must_use]
    pub fn is_open(&self, room_id: &str, user_id: &str) -> bool {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        open.contains(&(room_id.to_owned(), user_id.to_owned()))
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// Notifications for the host UI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Alert(Alert),
    /// Plain-text body from `/user/queue/invitations`.
    Invitation(String),
    /// The connection closed; no further messages will arrive.
    Disconnected,
}

/// What happened to LEAVE on close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    Published,
    PublishedViaFallback,
    Skipped,
}

/// Everything a session needs from its owning client.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) manager: ConnectionManager,
    pub(crate) backend: Arc<dyn ChatBackend>,
    pub(crate) registry: SessionRegistry,
    pub(crate) config: Arc<ChatConfig>,
}

pub struct RoomSession {
    room_id: String,
    user_id: String,
    room_type: RoomType,
    connection: Connection,
    stream: MessageStream,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    tasks: Vec<JoinHandle<()>>,
    context: SessionContext,
    left: bool,
    _lease: SessionLease,
}

impl RoomSession {
    pub(crate) async fn open(
        context: SessionContext,
        room_id: &str,
        user_id: &str,
        room_type: RoomType,
    ) -> Result<Self, SessionError> {
        let lease = context.registry.acquire(room_id, user_id)?;
        let connection = context.manager.connection(&context.config.socket_url())?;
        let connection_events = connection.events();
        connection.connect_with_retry(context.config.retry).await?;

        let topic = connection.subscribe(&room_topic(room_id));
        let errors = connection.subscribe(USER_ERRORS);
        let invitations = connection.subscribe(USER_INVITATIONS);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let stream = MessageStream::new();
        match context.backend.fetch_history(room_id).await {
            Ok(records) => stream.seed_history(records),
            Err(e) => {
                warn!(%room_id, error = %e, "session: history fetch failed");
                let _ = events_tx.send(SessionEvent::Alert(Alert::from_error(&e)));
                stream.seed_history(Vec::new());
            }
        }

        connection.publish(ADD_USER, &OutboundMessage::join(room_id, room_type, user_id))?;

        let tasks = vec![
            tokio::spawn(pump_topic(topic, stream.clone())),
            tokio::spawn(pump_errors(errors, events_tx.clone())),
            tokio::spawn(pump_invitations(invitations, events_tx.clone())),
            tokio::spawn(forward_connection_events(connection_events, events_tx)),
        ];

        info!(%room_id, %user_id, history = stream.len(), "session: joined");
        Ok(Self {
            room_id: room_id.to_owned(),
            user_id: user_id.to_owned(),
            room_type,
            connection,
            stream,
            events: Some(events_rx),
            tasks,
            context,
            left: false,
            _lease: lease,
        })
    }

    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn room_type(&self) -> RoomType {
        self.room_type
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn stream(&self) -> &MessageStream {
        &self.stream
    }

    /// The session's live connection, for invite/kick.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Alert/invitation channel. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Publish a CHAT message.
    ///
    /// # Errors
    ///
    /// [`SessionError::EmptyMessage`] for blank input, or
    /// [`ConnectionError::NotConnected`] when the socket is gone.
    pub fn send_message(&self, content: &str) -> Result<(), SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let body = OutboundMessage::chat(&self.room_id, &self.user_id, content);
        self.connection.publish(SEND_MESSAGE, &body)?;
        Ok(())
    }

    /// Publish LEAVE, then disconnect.
    pub async fn close(mut self) -> LeaveOutcome {
        let outcome = self.leave().await;
        self.connection.disconnect().await;
        self.stop_tasks();
        info!(room_id = %self.room_id, user_id = %self.user_id, ?outcome, "session: closed");
        outcome
    }

    async fn leave(&mut self) -> LeaveOutcome {
        self.left = true;
        let body = OutboundMessage::leave(&self.room_id, &self.user_id);
        if self.connection.publish(LEAVE_USER, &body).is_ok() {
            return LeaveOutcome::Published;
        }
        if !self.context.config.leave_fallback {
            info!(room_id = %self.room_id, "session: connection gone, LEAVE skipped");
            return LeaveOutcome::Skipped;
        }

        match publish_once(&self.context.manager, &self.context.config, LEAVE_USER, &body).await {
            Ok(()) => LeaveOutcome::PublishedViaFallback,
            Err(e) => {
                warn!(room_id = %self.room_id, error = %e, "session: fallback LEAVE failed");
                LeaveOutcome::Skipped
            }
        }
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if !self.left {
            self.left = true;
            let body = OutboundMessage::leave(&self.room_id, &self.user_id);
            if self.connection.publish(LEAVE_USER, &body).is_err() {
                info!(room_id = %self.room_id, "session: dropped without connection, LEAVE skipped");
            }
            self.connection.begin_close();
        }
        self.stop_tasks();
    }
}

// =============================================================================
// PUMPS
// =============================================================================

async fn pump_topic(mut topic: Subscription, stream: MessageStream) {
    while let Some(body) = topic.recv().await {
        stream.append(&body);
    }
}

async fn pump_errors(mut errors: Subscription, events: mpsc::UnboundedSender<SessionEvent>) {
    while let Some(body) = errors.recv().await {
        warn!(message = %body, "session: server error frame");
        if events.send(SessionEvent::Alert(Alert::server_error(body))).is_err() {
            break;
        }
    }
}

async fn pump_invitations(mut invitations: Subscription, events: mpsc::UnboundedSender<SessionEvent>) {
    while let Some(body) = invitations.recv().await {
        if events.send(SessionEvent::Invitation(body)).is_err() {
            break;
        }
    }
}

async fn forward_connection_events(
    mut connection_events: broadcast::Receiver<ConnectionEvent>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        let event = match connection_events.recv().await {
            Ok(ConnectionEvent::Connected) => continue,
            Ok(ConnectionEvent::Error { message, details }) => {
                SessionEvent::Alert(Alert::connection_lost(&message, &details))
            }
            Ok(ConnectionEvent::Closed) => SessionEvent::Disconnected,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "session: connection events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

//! Chat session lifecycle over STOMP.
//!
//! ARCHITECTURE
//! ============
//! ```text
//! ChatClient
//!   ├── RoomSession ──▶ Connection ──▶ Transport (WebSocket / SockJS)
//!   │      └── MessageStream
//!   ├── DirectoryActions (invite / kick, short-lived connections)
//!   └── ChatBackend (HTTP: history, participants, friends)
//! ```
//!
//! A session connects, subscribes, loads history, announces itself with
//! JOIN, then streams live messages until it is closed or dropped, at which
//! point LEAVE is published ahead of DISCONNECT.

pub mod alert;
pub mod api;
pub mod client;
pub mod config;
pub mod connection;
pub mod destination;
pub mod directory;
pub mod message;
pub mod session;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub mod test_helpers;

pub use alert::{Alert, ErrorCode};
pub use api::{ApiError, ChatApi, ChatBackend, Friend, RoomSummary};
pub use client::ChatClient;
pub use config::{ChatConfig, RetryPolicy};
pub use connection::{Connection, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState};
pub use directory::{DirectoryActions, RoomParticipant};
pub use message::{ChatMessage, MessageType, Rendered, RoomType};
pub use session::{LeaveOutcome, RoomSession, SessionError, SessionEvent};
pub use stream::MessageStream;
pub use transport::TransportKind;

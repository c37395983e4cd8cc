//! Invite/kick commands and the candidate lists that feed them.
//!
//! DESIGN
//! ======
//! INVITE and KICK ride the caller's live room connection when there is one.
//! Otherwise a short-lived connection is opened, the command published once,
//! and the socket closed after a settle delay so the broker has flushed the
//! frame. Neither command is retried or de-duplicated.
//!
//! Candidate lists are advisory and fetched fresh each time; lookup failures
//! degrade to empty lists instead of errors.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::api::{ChatBackend, Friend};
use crate::config::ChatConfig;
use crate::connection::{Connection, ConnectionError, ConnectionManager};
use crate::destination::{INVITE_USER, KICK_USER};
use crate::message::OutboundMessage;

/// A participant as offered in the kick list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomParticipant {
    pub user_id: String,
    pub display_name: String,
}

#[derive(Clone)]
pub struct DirectoryActions {
    manager: ConnectionManager,
    backend: Arc<dyn ChatBackend>,
    config: Arc<ChatConfig>,
}

impl DirectoryActions {
    #[must_use]
    pub fn new(manager: ConnectionManager, backend: Arc<dyn ChatBackend>, config: Arc<ChatConfig>) -> Self {
        Self { manager, backend, config }
    }

    /// Publish INVITE for `recipient`.
    ///
    /// # Errors
    ///
    /// Connect or publish failures of the short-lived connection.
    pub async fn invite(
        &self,
        active: Option<&Connection>,
        room_id: &str,
        sender: &str,
        recipient: &str,
    ) -> Result<(), ConnectionError> {
        info!(%room_id, %sender, %recipient, "directory: invite");
        self.dispatch(active, INVITE_USER, &OutboundMessage::invite(room_id, sender, recipient))
            .await
    }

    /// Publish KICK for `recipient`.
    ///
    /// # Errors
    ///
    /// Connect or publish failures of the short-lived connection.
    pub async fn kick(
        &self,
        active: Option<&Connection>,
        room_id: &str,
        sender: &str,
        recipient: &str,
        room_name: &str,
    ) -> Result<(), ConnectionError> {
        info!(%room_id, %sender, %recipient, "directory: kick");
        self.dispatch(active, KICK_USER, &OutboundMessage::kick(room_id, sender, recipient, room_name))
            .await
    }

    async fn dispatch(
        &self,
        active: Option<&Connection>,
        destination: &str,
        body: &OutboundMessage,
    ) -> Result<(), ConnectionError> {
        if let Some(connection) = active.filter(|c| c.is_connected()) {
            return connection.publish(destination, body);
        }
        publish_once(&self.manager, &self.config, destination, body).await
    }

    /// Raw participant ids for a room.
    ///
    /// # Errors
    ///
    /// HTTP failures from the backend.
    pub async fn list_room_participants(&self, room_id: &str) -> Result<Vec<String>, crate::api::ApiError> {
        self.backend.room_participants(room_id).await
    }

    /// Friends of `user_id` who are not already in the room.
    pub async fn list_invitable_friends(&self, user_id: &str, room_id: &str) -> Vec<Friend> {
        let (friends, participants) = self.lookup(user_id, room_id).await;
        friends
            .into_iter()
            .filter(|friend| friend.id != user_id)
            .filter(|friend| !participants.iter().any(|p| friend.matches(p)))
            .collect()
    }

    /// Participants other than `user_id`, named from the friend list when possible.
    pub async fn list_kick_candidates(&self, user_id: &str, room_id: &str) -> Vec<RoomParticipant> {
        let (friends, participants) = self.lookup(user_id, room_id).await;
        participants
            .into_iter()
            .filter(|id| id != user_id)
            .map(|id| {
                let display_name = friends
                    .iter()
                    .find(|friend| friend.matches(&id))
                    .map_or_else(|| id.clone(), |friend| friend.name.clone());
                RoomParticipant { user_id: id, display_name }
            })
            .collect()
    }

    async fn lookup(&self, user_id: &str, room_id: &str) -> (Vec<Friend>, Vec<String>) {
        let (friends, participants) =
            tokio::join!(self.backend.list_friends(user_id), self.backend.room_participants(room_id));

        let friends = friends.unwrap_or_else(|e| {
            warn!(%user_id, error = %e, "directory: friend lookup failed");
            Vec::new()
        });
        let participants = participants.unwrap_or_else(|e| {
            warn!(%room_id, error = %e, "directory: participant lookup failed");
            Vec::new()
        });
        (friends, participants)
    }
}

/// Open a connection, publish one frame, wait `settle_delay`, disconnect.
pub(crate) async fn publish_once(
    manager: &ConnectionManager,
    config: &ChatConfig,
    destination: &str,
    body: &impl Serialize,
) -> Result<(), ConnectionError> {
    let connection = manager.connection(&config.socket_url())?;
    connection.connect_with_retry(config.retry).await?;
    debug!(%destination, "directory: publishing over short-lived connection");

    let result = connection.publish(destination, body);
    if result.is_ok() {
        tokio::time::sleep(config.settle_delay).await;
    }
    connection.disconnect().await;
    result
}

#[cfg(test)]
#[path = "directory_test.rs"]
mod tests;

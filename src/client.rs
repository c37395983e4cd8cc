//! Entry point bundling configuration, connections, HTTP backend and session
//! bookkeeping for a host app.

use std::sync::Arc;

use crate::api::{ApiError, ChatApi, ChatBackend};
use crate::config::ChatConfig;
use crate::connection::{ConnectOptions, ConnectionManager};
use crate::directory::DirectoryActions;
use crate::message::RoomType;
use crate::session::{RoomSession, SessionContext, SessionError, SessionRegistry};
use crate::transport::{Connector, WsConnector};

#[derive(Clone)]
pub struct ChatClient {
    context: SessionContext,
    directory: DirectoryActions,
}

impl ChatClient {
    /// Client talking to the configured backend over real sockets.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built from `config`.
    pub fn new(config: ChatConfig) -> Result<Self, ApiError> {
        let backend = Arc::new(ChatApi::new(&config)?);
        let connector = Arc::new(WsConnector::new(config.transport));
        Ok(Self::with_parts(config, connector, backend))
    }

    /// Client over caller-supplied socket and HTTP implementations.
    #[must_use]
    pub fn with_parts(config: ChatConfig, connector: Arc<dyn Connector>, backend: Arc<dyn ChatBackend>) -> Self {
        let manager = ConnectionManager::new(connector, ConnectOptions::from_config(&config));
        let config = Arc::new(config);
        let directory = DirectoryActions::new(manager.clone(), Arc::clone(&backend), Arc::clone(&config));
        Self {
            context: SessionContext { manager, backend, registry: SessionRegistry::default(), config },
            directory,
        }
    }

    /// Join `room_id` as `user_id`.
    ///
    /// # Errors
    ///
    /// [`SessionError::AlreadyOpen`] when this client already has the pair
    /// open, or the connection error that prevented joining.
    pub async fn open_session(
        &self,
        room_id: &str,
        user_id: &str,
        room_type: RoomType,
    ) -> Result<RoomSession, SessionError> {
        RoomSession::open(self.context.clone(), room_id, user_id, room_type).await
    }

    #[must_use]
    pub fn is_session_open(&self, room_id: &str, user_id: &str) -> bool {
        self.context.registry.is_open(room_id, user_id)
    }

    #[must_use]
    pub fn directory(&self) -> &DirectoryActions {
        &self.directory
    }

    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.context.manager
    }

    #[must_use]
    pub fn config(&self) -> &ChatConfig {
        &self.context.config
    }
}

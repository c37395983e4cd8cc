//! HTTP collaborators of the chat backend.
//!
//! DESIGN
//! ======
//! [`ChatBackend`] is the narrow seam sessions and directory lookups depend
//! on; [`ChatApi`] is its `reqwest` implementation. Record shapes from the
//! backend drift between endpoints, so everything is read as
//! `serde_json::Value` and mapped field by field with fallbacks.

use async_trait::async_trait;
use reqwest::{Method, Url};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::alert::ErrorCode;
use crate::config::ChatConfig;
use crate::message::now_ms;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{path} returned HTTP {status}")]
    Status { status: u16, path: String },
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),
    #[error("{0} requires an auth token")]
    MissingToken(&'static str),
    #[error("unexpected response shape from {0}")]
    UnexpectedShape(String),
    #[error("invalid api base url: {0}")]
    InvalidBaseUrl(String),
}

impl ErrorCode for ApiError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Http(_) => "E_HTTP",
            Self::Status { .. } => "E_HTTP_STATUS",
            Self::InvalidHeader(_) => "E_INVALID_HEADER",
            Self::MissingToken(_) => "E_MISSING_TOKEN",
            Self::UnexpectedShape(_) => "E_HTTP_SHAPE",
            Self::InvalidBaseUrl(_) => "E_INVALID_BASE_URL",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Read-side HTTP dependencies of sessions and directory lookups.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Message-shaped records for a room, oldest first.
    async fn fetch_history(&self, room_id: &str) -> Result<Vec<Value>, ApiError>;

    /// User ids currently in a room.
    async fn room_participants(&self, room_id: &str) -> Result<Vec<String>, ApiError>;

    async fn list_friends(&self, user_id: &str) -> Result<Vec<Friend>, ApiError>;
}

// =============================================================================
// RECORDS
// =============================================================================

const FRIEND_ID_FIELDS: [&str; 4] = ["friendUserId", "id", "userId", "email"];
const FRIEND_NAME_FIELDS: [&str; 4] = ["friendNickname", "name", "nickname", "username"];

/// A friend-list entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Friend {
    pub id: String,
    pub name: String,
    /// Every id-like or name-like value the record carried.
    pub identifiers: Vec<String>,
}

impl Friend {
    /// Map a backend friend record. `None` when it has no usable id.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = first_field(value, &FRIEND_ID_FIELDS)?;
        let name = first_field(value, &FRIEND_NAME_FIELDS).unwrap_or_else(|| id.clone());

        let mut identifiers: Vec<String> = Vec::new();
        for field in FRIEND_ID_FIELDS.iter().chain(FRIEND_NAME_FIELDS.iter()) {
            if let Some(v) = value.get(field).and_then(scalar) {
                if !identifiers.contains(&v) {
                    identifiers.push(v);
                }
            }
        }

        Some(Self { id, name, identifiers })
    }

    #[must_use]
    pub fn matches(&self, user_id: &str) -> bool {
        self.id == user_id || self.identifiers.iter().any(|i| i == user_id)
    }
}

/// A chat room as listed or created by the backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    pub is_group: bool,
    pub participants: Vec<String>,
}

impl RoomSummary {
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = first_field(value, &["id", "roomId"])?;
        Some(Self {
            name: first_field(value, &["name", "roomName"]).unwrap_or_default(),
            is_group: value.get("isGroup").and_then(Value::as_bool).unwrap_or(false),
            participants: value
                .get("participants")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(participant_id).collect())
                .unwrap_or_default(),
            id,
        })
    }

    /// Client-side room used when the backend cannot create one.
    #[must_use]
    pub fn local_fallback(current_user: &str, friend: &str, room_name: Option<&str>) -> Self {
        let now = now_ms().to_string();
        let suffix = &now[now.len().saturating_sub(4)..];
        Self {
            id: format!("{current_user}_{friend}_{now}"),
            name: room_name
                .filter(|n| !n.is_empty())
                .map_or_else(|| format!("새 채팅방({suffix})"), str::to_owned),
            is_group: false,
            participants: vec![current_user.to_owned(), friend.to_owned()],
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_field(value: &Value, fields: &[&str]) -> Option<String> {
    fields.iter().find_map(|field| value.get(field).and_then(scalar))
}

fn participant_id(value: &Value) -> Option<String> {
    scalar(value).or_else(|| first_field(value, &["userId", "id"]))
}

fn static_segments(path: &'static str) -> Vec<&'static str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn as_array(value: Value, path: &str) -> Result<Vec<Value>, ApiError> {
    match value {
        Value::Array(items) => Ok(items),
        _ => Err(ApiError::UnexpectedShape(path.to_owned())),
    }
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

#[derive(Clone)]
pub struct ChatApi {
    client: reqwest::Client,
    base_url: Url,
    has_token: bool,
}

impl ChatApi {
    /// # Errors
    ///
    /// Fails when the base URL does not parse, the token is not a valid
    /// header value, or the TLS backend cannot initialize.
    pub fn new(config: &ChatConfig) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
        }
        let client = reqwest::Client::builder().default_headers(headers).build()?;
        let base_url = Url::parse(config.api_base_url.trim_end_matches('/'))
            .map_err(|e| ApiError::InvalidBaseUrl(format!("{}: {e}", config.api_base_url)))?;

        Ok(Self { client, base_url, has_token: config.auth_token.is_some() })
    }

    /// Base URL with `segments` appended, each percent-encoded.
    fn url_for(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let (status, value, path) = self.send(method, segments, query, body).await?;
        if !(200..300).contains(&status) {
            return Err(ApiError::Status { status, path });
        }
        Ok(value)
    }

    /// Returns the status, the JSON body (`Null` when absent) and the
    /// encoded request path.
    async fn send(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<(u16, Value, String), ApiError> {
        let url = self.url_for(segments)?;
        let path = url.path().to_owned();
        let request = self.client.request(method, url).query(query);
        let request = if let Some(json) = body {
            request.json(&json)
        } else {
            request
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let value = response.json::<Value>().await.unwrap_or_else(|_| Value::Null);
        Ok((status, value, path))
    }

    /// Group rooms the user belongs to.
    ///
    /// # Errors
    ///
    /// [`ApiError::MissingToken`] without a token; otherwise HTTP failures.
    pub async fn list_rooms(&self, user_id: &str) -> Result<Vec<RoomSummary>, ApiError> {
        self.list_room_kind("/api/chat/rooms", user_id).await
    }

    /// One-to-one rooms the user belongs to.
    ///
    /// # Errors
    ///
    /// Same as [`ChatApi::list_rooms`].
    pub async fn list_one_to_one_rooms(&self, user_id: &str) -> Result<Vec<RoomSummary>, ApiError> {
        self.list_room_kind("/api/chat/one-to-one-rooms", user_id).await
    }

    async fn list_room_kind(&self, path: &'static str, user_id: &str) -> Result<Vec<RoomSummary>, ApiError> {
        if !self.has_token {
            return Err(ApiError::MissingToken(path));
        }
        let value = self.request(Method::GET, &static_segments(path), &[("userId", user_id)], None).await?;
        Ok(as_array(value, path)?.iter().filter_map(RoomSummary::from_value).collect())
    }

    /// Create a one-to-one room, falling back to a local-only room when there
    /// is no token or the backend refuses.
    pub async fn create_one_to_one_room(
        &self,
        current_user: &str,
        friend: &str,
        room_name: Option<&str>,
    ) -> RoomSummary {
        if !self.has_token {
            info!(%current_user, %friend, "api: no token, creating local room");
            return RoomSummary::local_fallback(current_user, friend, room_name);
        }

        let body = json!({
            "name": room_name.unwrap_or_default(),
            "isGroup": false,
            "participants": [current_user, friend],
        });
        match self.send(Method::POST, &["api", "chat", "rooms"], &[], Some(body)).await {
            Ok((status, value, _)) if (200..300).contains(&status) => {
                let room = value.get("room").unwrap_or(&value);
                if let Some(summary) = RoomSummary::from_value(room) {
                    return summary;
                }
                warn!(status, "api: room creation returned no room, using local room");
            }
            Ok((status, _, _)) => {
                if status != 404 && status != 405 {
                    warn!(status, "api: room creation refused, using local room");
                }
            }
            Err(e) => warn!(error = %e, "api: room creation failed, using local room"),
        }
        RoomSummary::local_fallback(current_user, friend, room_name)
    }
}

#[async_trait]
impl ChatBackend for ChatApi {
    async fn fetch_history(&self, room_id: &str) -> Result<Vec<Value>, ApiError> {
        let segments = ["api", "chat", "rooms", room_id, "messages"];
        let value = self.request(Method::GET, &segments, &[], None).await?;
        as_array(value, &format!("/{}", segments.join("/")))
    }

    async fn room_participants(&self, room_id: &str) -> Result<Vec<String>, ApiError> {
        let path = "/api/chat/rooms/participants";
        let body = Some(json!({ "roomId": room_id }));
        let value = self.request(Method::POST, &static_segments(path), &[], body).await?;
        Ok(as_array(value, path)?.iter().filter_map(participant_id).collect())
    }

    async fn list_friends(&self, user_id: &str) -> Result<Vec<Friend>, ApiError> {
        let segments = ["api", "friends", user_id, "friends"];
        let value = self.request(Method::GET, &segments, &[], None).await?;
        Ok(as_array(value, &format!("/{}", segments.join("/")))?.iter().filter_map(Friend::from_value).collect())
    }
}

#[cfg(test)]
#[path = "api_test.rs"]
mod tests;

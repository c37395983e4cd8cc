//! Chat message model: inbound records, outbound bodies and their display form.
//!
//! DESIGN
//! ======
//! Inbound bodies are decoded leniently: the server and the history endpoint
//! disagree on id types, and older records omit fields. Anything missing gets
//! a default, a missing id is synthesized, and an unrecognised `type` becomes
//! [`MessageType::Unknown`] so it stays in the log but is never rendered.
//!
//! Outbound bodies are built only through the [`OutboundMessage`]
//! constructors so each destination gets exactly the fields it expects.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ID_SUFFIX_LEN: usize = 9;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Chat,
    Join,
    Leave,
    Invite,
    Kick,
    #[default]
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomType {
    #[default]
    OneToOne,
    Group,
}

impl std::str::FromStr for RoomType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "ONE_TO_ONE" => Ok(Self::OneToOne),
            "GROUP" => Ok(Self::Group),
            other => Err(format!("unknown room type: {other}")),
        }
    }
}

/// One entry in a room's message log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_type: Option<RoomType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "type")]
    kind: MessageType,
    #[serde(default)]
    sender: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    room_id: Option<Value>,
    #[serde(default)]
    room_type: Option<Value>,
    #[serde(default)]
    room_name: Option<String>,
}

impl ChatMessage {
    /// Decode a message body, synthesizing an id when none is present.
    ///
    /// # Errors
    ///
    /// Fails when `raw` is not a JSON object with string-typed text fields.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let record: RawMessage = serde_json::from_str(raw)?;
        Ok(Self::from_raw(record))
    }

    /// Same as [`ChatMessage::parse`] for an already-decoded history record.
    ///
    /// # Errors
    ///
    /// Fails when `value` is not an object of the expected shape.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let record: RawMessage = serde_json::from_value(value)?;
        Ok(Self::from_raw(record))
    }

    fn from_raw(record: RawMessage) -> Self {
        Self {
            id: record.id.as_ref().and_then(scalar_to_string).unwrap_or_else(synthesize_id),
            kind: record.kind,
            sender: record.sender.unwrap_or_default(),
            recipient: record.recipient,
            content: record.content.unwrap_or_default(),
            room_id: record.room_id.as_ref().and_then(scalar_to_string),
            room_type: record.room_type.and_then(|v| serde_json::from_value(v).ok()),
            room_name: record.room_name,
        }
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Current time as milliseconds since Unix epoch.
pub(crate) fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

/// Fallback message id: epoch millis followed by nine random base-36 chars.
#[must_use]
pub fn synthesize_id() -> String {
    let mut rng = rand::rng();
    let mut id = now_ms().to_string();
    id.extend((0..ID_SUFFIX_LEN).map(|_| char::from(ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())])));
    id
}

// =============================================================================
// OUTBOUND
// =============================================================================

/// Body of a SEND to one of the `/app/chat.*` destinations.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub room_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_type: Option<RoomType>,
    pub sender: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_name: Option<String>,
}

impl OutboundMessage {
    fn base(kind: MessageType, room_id: &str, sender: &str) -> Self {
        Self {
            kind,
            room_id: room_id.to_owned(),
            room_type: None,
            sender: sender.to_owned(),
            recipient: None,
            content: None,
            room_name: None,
        }
    }

    #[must_use]
    pub fn join(room_id: &str, room_type: RoomType, sender: &str) -> Self {
        Self { room_type: Some(room_type), ..Self::base(MessageType::Join, room_id, sender) }
    }

    #[must_use]
    pub fn chat(room_id: &str, sender: &str, content: &str) -> Self {
        Self { content: Some(content.to_owned()), ..Self::base(MessageType::Chat, room_id, sender) }
    }

    #[must_use]
    pub fn leave(room_id: &str, sender: &str) -> Self {
        Self {
            content: Some(format!("{sender}님이 퇴장했습니다.")),
            ..Self::base(MessageType::Leave, room_id, sender)
        }
    }

    #[must_use]
    pub fn invite(room_id: &str, sender: &str, recipient: &str) -> Self {
        Self {
            recipient: Some(recipient.to_owned()),
            content: Some(String::new()),
            ..Self::base(MessageType::Invite, room_id, sender)
        }
    }

    #[must_use]
    pub fn kick(room_id: &str, sender: &str, recipient: &str, room_name: &str) -> Self {
        Self {
            recipient: Some(recipient.to_owned()),
            content: Some(String::new()),
            room_name: Some(room_name.to_owned()),
            ..Self::base(MessageType::Kick, room_id, sender)
        }
    }
}

// =============================================================================
// DISPLAY
// =============================================================================

/// How a log entry is shown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rendered {
    /// A chat bubble; `mine` aligns it to the local user's side.
    Bubble { mine: bool, sender: String, content: String },
    /// A centred system notice.
    Notice(String),
}

/// Map a message to its display form. Unknown types render as nothing.
#[must_use]
pub fn classify(message: &ChatMessage, local_user: &str) -> Option<Rendered> {
    let sender = &message.sender;
    let recipient = message.recipient.as_deref().unwrap_or_default();
    match message.kind {
        MessageType::Chat => Some(Rendered::Bubble {
            mine: sender == local_user,
            sender: sender.clone(),
            content: message.content.clone(),
        }),
        MessageType::Join => Some(Rendered::Notice(format!("{sender}님이 입장했습니다."))),
        MessageType::Leave => Some(Rendered::Notice(format!("{sender}님이 퇴장했습니다."))),
        MessageType::Invite => Some(Rendered::Notice(format!("{sender}님이 {recipient}님을 초대했습니다."))),
        MessageType::Kick => Some(Rendered::Notice(format!("{sender}님이 {recipient}님을 강퇴했습니다."))),
        MessageType::Unknown => None,
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

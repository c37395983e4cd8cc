//! SockJS websocket-transport envelopes.
//!
//! The server wraps every STOMP payload in a SockJS frame: `o` on open, `h`
//! for heart-beats, `a[...]` for a batch of messages, `c[code,"reason"]` on
//! close. Clients send a JSON array of strings.

use serde_json::Value;

/// Error returned by [`decode`].
#[derive(Debug, thiserror::Error)]
pub enum SockJsError {
    #[error("empty sockjs frame")]
    Empty,
    #[error("unknown sockjs frame type: {0:?}")]
    UnknownType(char),
    #[error("invalid sockjs payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected sockjs payload shape: {0}")]
    Shape(String),
}

/// A decoded SockJS frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SockJsFrame {
    Open,
    Heartbeat,
    Messages(Vec<String>),
    Close { code: u16, reason: String },
}

/// Decode one SockJS frame.
///
/// # Errors
///
/// Returns [`SockJsError`] for unknown prefixes or payloads that are not the
/// JSON shape the prefix implies.
pub fn decode(text: &str) -> Result<SockJsFrame, SockJsError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(SockJsError::Empty)?;
    let payload = chars.as_str();

    match kind {
        'o' => Ok(SockJsFrame::Open),
        'h' => Ok(SockJsFrame::Heartbeat),
        'a' => Ok(SockJsFrame::Messages(serde_json::from_str(payload)?)),
        'm' => Ok(SockJsFrame::Messages(vec![serde_json::from_str(payload)?])),
        'c' => {
            let value: Value = serde_json::from_str(payload)?;
            let code = value
                .get(0)
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .ok_or_else(|| SockJsError::Shape(payload.to_owned()))?;
            let reason = value.get(1).and_then(Value::as_str).unwrap_or_default().to_owned();
            Ok(SockJsFrame::Close { code, reason })
        }
        other => Err(SockJsError::UnknownType(other)),
    }
}

/// Encode outbound messages as the JSON string array SockJS expects.
///
/// # Errors
///
/// Propagates `serde_json` failures.
pub fn encode_messages(messages: &[String]) -> Result<String, SockJsError> {
    Ok(serde_json::to_string(messages)?)
}

#[cfg(test)]
#[path = "sockjs_test.rs"]
mod tests;

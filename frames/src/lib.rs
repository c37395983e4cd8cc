//! Shared frame model and STOMP 1.2 text codec for the chat socket.
//!
//! This crate owns the wire representation used by the `roomchat` library and
//! the CLI. Frames are plain text: a command line, `key:value` header lines, a
//! blank line, an optional body and a NUL terminator. Bare EOLs between frames
//! are heart-beats and are skipped by [`decode_frames`].
//!
//! SockJS envelopes that may wrap these frames live in [`sockjs`].

use std::time::Duration;

pub mod sockjs;

/// Error returned by [`decode_frame`] and [`decode_frames`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input held only heart-beat EOLs where a frame was expected.
    #[error("no frame in input")]
    Empty,
    /// The input ended before the header block was complete.
    #[error("truncated frame")]
    Truncated,
    /// The command line is not a STOMP command.
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    /// A header line has no `:` separator or a bad `content-length`.
    #[error("malformed header: {0}")]
    MalformedHeader(String),
    /// A header contains an escape sequence STOMP 1.2 does not define.
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
    /// The body is not followed by a NUL octet.
    #[error("frame body is not NUL-terminated")]
    MissingNul,
    /// [`decode_frame`] found more than one frame.
    #[error("expected one frame, found {0}")]
    TrailingFrames(usize),
}

/// STOMP command verbs, client and server side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Wire spelling of the command.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// Parse a command line.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownCommand`] for anything not in STOMP 1.2.
    pub fn parse(value: &str) -> Result<Self, CodecError> {
        Ok(match value {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(CodecError::UnknownCommand(other.to_owned())),
        })
    }

    /// CONNECT and CONNECTED carry raw header values; every other frame escapes.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame verb.
    pub command: Command,
    /// Headers in wire order. Repeated keys are allowed; the first one wins.
    pub headers: Vec<(String, String)>,
    /// Text body. Empty for most control frames.
    pub body: String,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of `key`, per STOMP repeated-header rules.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

// =============================================================================
// CODEC
// =============================================================================

/// Encode a frame as STOMP text.
///
/// A `content-length` header is added for non-empty bodies unless the caller
/// already set one.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(frame.body.len() + 64);
    out.push_str(frame.command.as_str());
    out.push('\n');

    for (key, value) in &frame.headers {
        if escape {
            out.push_str(&escape_header(key));
            out.push(':');
            out.push_str(&escape_header(value));
        } else {
            out.push_str(key);
            out.push(':');
            out.push_str(value);
        }
        out.push('\n');
    }
    if !frame.body.is_empty() && frame.header("content-length").is_none() {
        out.push_str("content-length:");
        out.push_str(&frame.body.len().to_string());
        out.push('\n');
    }

    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode every frame in `input`, skipping heart-beat EOLs between them.
///
/// # Errors
///
/// Returns the first [`CodecError`] hit while scanning.
pub fn decode_frames(input: &str) -> Result<Vec<Frame>, CodecError> {
    let mut frames = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(['\r', '\n']);
        if rest.is_empty() {
            return Ok(frames);
        }
        let (frame, consumed) = decode_one(rest)?;
        frames.push(frame);
        rest = &rest[consumed..];
    }
}

/// Decode exactly one frame.
///
/// # Errors
///
/// Returns [`CodecError::Empty`] for a heart-beat-only input and
/// [`CodecError::TrailingFrames`] when more than one frame is present.
pub fn decode_frame(input: &str) -> Result<Frame, CodecError> {
    let mut frames = decode_frames(input)?;
    match frames.len() {
        0 => Err(CodecError::Empty),
        1 => Ok(frames.remove(0)),
        n => Err(CodecError::TrailingFrames(n)),
    }
}

/// `true` when the text is only heart-beat EOLs.
#[must_use]
pub fn is_heartbeat(input: &str) -> bool {
    !input.is_empty() && input.chars().all(|c| c == '\n' || c == '\r')
}

fn decode_one(input: &str) -> Result<(Frame, usize), CodecError> {
    let (line, mut pos) = read_line(input, 0).ok_or(CodecError::Truncated)?;
    let command = Command::parse(line)?;

    let mut headers = Vec::new();
    loop {
        let (line, next) = read_line(input, pos).ok_or(CodecError::Truncated)?;
        pos = next;
        if line.is_empty() {
            break;
        }
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| CodecError::MalformedHeader(line.to_owned()))?;
        if command.escapes_headers() {
            headers.push((unescape_header(key)?, unescape_header(value)?));
        } else {
            headers.push((key.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| CodecError::MalformedHeader(format!("content-length:{v}")))
        })
        .transpose()?;

    let (body, consumed) = match content_length {
        Some(len) => {
            let end = pos.checked_add(len).ok_or(CodecError::Truncated)?;
            let body = input.get(pos..end).ok_or(CodecError::Truncated)?;
            if input.as_bytes().get(end) != Some(&0) {
                return Err(CodecError::MissingNul);
            }
            (body, end + 1)
        }
        None => {
            let nul = input[pos..].find('\0').ok_or(CodecError::MissingNul)?;
            (&input[pos..pos + nul], pos + nul + 1)
        }
    };

    Ok((Frame { command, headers, body: body.to_owned() }, consumed))
}

/// Read one EOL-terminated line starting at `pos`; returns the line without
/// its `\r\n`/`\n` and the offset just past it.
fn read_line(input: &str, pos: usize) -> Option<(&str, usize)> {
    let rest = input.get(pos..)?;
    let idx = rest.find('\n')?;
    let line = rest[..idx].strip_suffix('\r').unwrap_or(&rest[..idx]);
    Some((line, pos + idx + 1))
}

fn escape_header(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(value: &str) -> Result<String, CodecError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(CodecError::InvalidEscape(value.to_owned())),
        }
    }
    Ok(out)
}

// =============================================================================
// HEART-BEAT
// =============================================================================

/// One side's `heart-beat` header: `outgoing,incoming` in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeartBeat {
    /// Smallest interval this side can send at; `0` means never.
    pub outgoing_ms: u64,
    /// Interval this side wants to receive at; `0` means never.
    pub incoming_ms: u64,
}

impl HeartBeat {
    #[must_use]
    pub fn new(outgoing_ms: u64, incoming_ms: u64) -> Self {
        Self { outgoing_ms, incoming_ms }
    }

    /// Parse a `heart-beat` header value. Malformed values mean "no heart-beat".
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut parts = value.split(',').map(|p| p.trim().parse::<u64>().unwrap_or(0));
        Self {
            outgoing_ms: parts.next().unwrap_or(0),
            incoming_ms: parts.next().unwrap_or(0),
        }
    }

    /// Header value for this heart-beat.
    #[must_use]
    pub fn header_value(self) -> String {
        format!("{},{}", self.outgoing_ms, self.incoming_ms)
    }
}

/// Result of heart-beat negotiation from the client's point of view.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Negotiated {
    /// How often the client must send an EOL, if at all.
    pub send_every: Option<Duration>,
    /// How often the client expects traffic from the server, if at all.
    pub expect_every: Option<Duration>,
}

/// Negotiate heart-beats per STOMP 1.2: each direction is active only when
/// both sides ask for it, at the larger of the two intervals.
#[must_use]
pub fn negotiate(client: HeartBeat, server: HeartBeat) -> Negotiated {
    let pick = |a: u64, b: u64| (a != 0 && b != 0).then(|| Duration::from_millis(a.max(b)));
    Negotiated {
        send_every: pick(client.outgoing_ms, server.incoming_ms),
        expect_every: pick(client.incoming_ms, server.outgoing_ms),
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;

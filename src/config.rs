//! Runtime configuration for the chat client.
//!
//! DESIGN
//! ======
//! Everything is read from `CHAT_*` environment variables with compiled-in
//! defaults. Unparseable values fall back to the default rather than failing,
//! matching how the rest of the stack treats tuning knobs. `from_lookup` takes
//! the variable source as a closure so tests never touch the process env.

use std::time::Duration;

use crate::transport::TransportKind;

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_SOCKET_PATH: &str = "/ws-chat";

const DEFAULT_HEARTBEAT_OUTGOING_MS: u64 = 20_000;
const DEFAULT_HEARTBEAT_INCOMING_MS: u64 = 0;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Delay before tearing down a short-lived publish connection.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);

const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 1;
const DEFAULT_RETRY_INITIAL_MS: u64 = 1_000;
const DEFAULT_RETRY_MAX_MS: u64 = 10_000;

/// Connect retry schedule. Backoff doubles after each failed attempt up to
/// `max_backoff`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `1` disables retry.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    #[must_use]
    pub fn none() -> Self {
        Self { max_attempts: 1, ..Self::default() }
    }

    /// Backoff to wait after `attempt` (1-based) has failed.
    #[must_use]
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_INITIAL_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// REST origin, e.g. `https://api.example.com`.
    pub api_base_url: String,
    /// Socket endpoint path appended to `api_base_url`.
    pub socket_path: String,
    pub transport: TransportKind,
    /// Bearer token for REST calls and the STOMP `Authorization` header.
    pub auth_token: Option<String>,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
    /// `None` waits for CONNECTED indefinitely.
    pub connect_timeout: Option<Duration>,
    pub settle_delay: Duration,
    pub retry: RetryPolicy,
    /// Send LEAVE over a short-lived connection when the session's own
    /// connection is already gone.
    pub leave_fallback: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl ChatConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

        let connect_timeout_ms = parse("CHAT_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT_MS);
        let max_attempts = lookup("CHAT_RETRY_MAX_ATTEMPTS")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS)
            .max(1);

        Self {
            api_base_url: non_empty("CHAT_API_BASE_URL")
                .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned())
                .trim_end_matches('/')
                .to_owned(),
            socket_path: non_empty("CHAT_SOCKET_PATH").unwrap_or_else(|| DEFAULT_SOCKET_PATH.to_owned()),
            transport: non_empty("CHAT_TRANSPORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            auth_token: non_empty("CHAT_AUTH_TOKEN"),
            heartbeat_outgoing: Duration::from_millis(parse(
                "CHAT_HEARTBEAT_OUTGOING_MS",
                DEFAULT_HEARTBEAT_OUTGOING_MS,
            )),
            heartbeat_incoming: Duration::from_millis(parse(
                "CHAT_HEARTBEAT_INCOMING_MS",
                DEFAULT_HEARTBEAT_INCOMING_MS,
            )),
            connect_timeout: (connect_timeout_ms > 0).then(|| Duration::from_millis(connect_timeout_ms)),
            settle_delay: lookup("CHAT_SETTLE_DELAY_MS")
                .and_then(|v| v.trim().parse().ok())
                .map_or(DEFAULT_SETTLE_DELAY, Duration::from_millis),
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(parse("CHAT_RETRY_INITIAL_MS", DEFAULT_RETRY_INITIAL_MS)),
                max_backoff: Duration::from_millis(parse("CHAT_RETRY_MAX_MS", DEFAULT_RETRY_MAX_MS)),
            },
            leave_fallback: lookup("CHAT_LEAVE_FALLBACK").is_some_and(|v| matches!(v.trim(), "1" | "true" | "yes")),
        }
    }

    /// Full socket URL, before any scheme conversion.
    #[must_use]
    pub fn socket_url(&self) -> String {
        let path = self.socket_path.trim_start_matches('/');
        format!("{}/{path}", self.api_base_url)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;

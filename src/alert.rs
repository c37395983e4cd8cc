//! User-facing alerts and the error-code contract shared by every error type.
//!
//! Errors that reach the host app are flattened into an [`Alert`] carrying a
//! stable, grep-able code, the display message and a retry hint.

/// Stable machine-readable code for an error.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Code used for plain-text bodies from `/user/queue/errors`.
pub const SERVER_ERROR_FRAME: &str = "E_SERVER_ERROR_FRAME";
/// Code used when a live connection reports a broker or transport failure.
pub const CONNECTION_LOST: &str = "E_CONNECTION_LOST";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Alert {
    pub code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl Alert {
    #[must_use]
    pub fn from_error(err: &(impl ErrorCode + ?Sized)) -> Self {
        Self {
            code: err.error_code(),
            message: err.to_string(),
            retryable: err.retryable(),
        }
    }

    /// Alert for a server error frame; the body is shown verbatim.
    #[must_use]
    pub fn server_error(text: impl Into<String>) -> Self {
        Self { code: SERVER_ERROR_FRAME, message: text.into(), retryable: false }
    }

    #[must_use]
    pub fn connection_lost(message: &str, details: &str) -> Self {
        let message = if details.is_empty() { message.to_owned() } else { format!("{message}: {details}") };
        Self { code: CONNECTION_LOST, message, retryable: true }
    }
}

impl std::fmt::Display for Alert {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

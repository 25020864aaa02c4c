//! Streaming error taxonomy

use thiserror::Error;

/// Generic user-facing text for a failed assistant turn
pub const ERROR_TURN_MESSAGE: &str = "Sorry, I encountered an error. Please try again.";

/// Errors raised while streaming a response
///
/// `FrameDecode` and `FrameParse` are recovered locally (the frame is
/// skipped). `Protocol`, `Transport` and `Cancelled` end the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// A frame could not be decoded as UTF-8 or exceeded the size bound
    #[error("Frame decode failed: {0}")]
    FrameDecode(String),

    /// A `data:` frame carried malformed JSON or an unknown event type
    #[error("Frame parse failed: {0}")]
    FrameParse(String),

    /// The server reported an error event
    #[error("Server error: {0}")]
    Protocol(String),

    /// Connection, HTTP status or premature end of stream
    #[error("Transport error{}: {detail}", status_suffix(.status))]
    Transport {
        /// HTTP status, when the server answered
        status: Option<u16>,
        /// Failure detail
        detail: String,
    },

    /// The request was cancelled locally
    #[error("Request cancelled ({0})")]
    Cancelled(CancelReason),

    /// A request is already streaming on this session
    #[error("A request is already in flight")]
    RequestInFlight,

    /// The request was rejected before any transport was opened
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Controller misuse (e.g. starting a sealed controller)
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl StreamError {
    /// Transport failure without an HTTP status
    pub fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            status: None,
            detail: detail.into(),
        }
    }

    /// Whether this error ends the request
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::FrameDecode(_) | Self::FrameParse(_))
    }

    /// Whether this failure produces a user-visible error turn
    #[must_use]
    pub fn is_user_visible(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Transport { .. })
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport {
            status: e.status().map(|s| s.as_u16()),
            detail: e.to_string(),
        }
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {code})"),
        None => String::new(),
    }
}

/// Why a request was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled
    User,
    /// No bytes arrived within the idle timeout
    TimedOut,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::TimedOut => f.write_str("idle timeout"),
        }
    }
}

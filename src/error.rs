//! Error type shared by every chathub operation.
//!
//! Only conditions that end a turn (or a maintenance call) are errors.
//! A refused image prompt or an exhausted conversation is reported to the
//! caller as an [`Apology`](crate::events::ChatEvent::Apology) event instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The service answered the bootstrap request with something that is not
    /// conversation data. Carries the raw response body.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A network operation failed on every attempt of its retry budget.
    #[error("max retry exceeded after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ChatError>,
    },

    /// The terminal frame of a turn reported an explicit error.
    #[error("{value}: {message}")]
    Remote { value: String, message: String },

    /// The socket stayed silent for longer than the empty-receive budget.
    #[error("no response from server")]
    ProtocolTimeout,

    /// The remote side closed the socket before the turn completed.
    #[error("connection closed before the turn completed")]
    ConnectionClosed,

    #[error("conversation not found: {0}")]
    UnknownConversation(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ChatError {
    /// Unwraps retry exhaustion down to the error of the final attempt.
    pub fn root(&self) -> &ChatError {
        match self {
            Self::RetryExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

pub type Result<T, E = ChatError> = std::result::Result<T, E>;

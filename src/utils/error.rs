//! The `error` module defines the error type shared by every layer of the relay.
//!
//! Errors are scoped to the piece of work that produced them: a bad frame is
//! skipped, a failed socket ends one connection, and nothing here is allowed to
//! bring the process down.

use std::time::Duration;

use thiserror::Error;

use crate::broker::message::Action;
use crate::transport::connection::ConnectionId;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to encode envelope: {0}")]
    Encoding(#[source] serde_json::Error),

    #[error("failed to decode envelope: {0}")]
    Decoding(#[source] serde_json::Error),

    #[error("expected action '{expected}', got '{got}'")]
    UnexpectedAction { expected: Action, got: Action },

    #[error("action '{action}' is not allowed on a {role} connection")]
    ActionNotAllowed { action: Action, role: &'static str },

    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("websocket transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("no progress on the connection for {0:?}")]
    Timeout(Duration),

    #[error("mailbox of connection {0} is full")]
    SlowConsumer(ConnectionId),

    #[error("mailbox of connection {0} is closed")]
    MailboxClosed(ConnectionId),

    #[error("topic '{0}' is no longer running")]
    TopicClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
}

impl RelayError {
    /// Whether this error only says the peer already started or finished the
    /// close handshake.
    pub fn is_already_closed(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(
                tungstenite::Error::ConnectionClosed
                    | tungstenite::Error::AlreadyClosed
                    | tungstenite::Error::Protocol(
                        tungstenite::error::ProtocolError::SendAfterClosing
                    )
            )
        )
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

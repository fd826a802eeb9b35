//! Proxy error types.

use std::io;
use std::time::Duration;

use thiserror::Error;

use slider_mc::ProtocolError;

use crate::auth::AuthError;

/// Errors raised while talking to a backend server.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No backend is registered under this name.
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// The backend is registered but disabled by the operator.
    #[error("Server {0} is disabled")]
    Disabled(String),

    /// The TCP connection could not be established.
    #[error("Failed to connect to {server}: {source}")]
    Connect {
        /// Backend name.
        server: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The backend did not answer in time.
    #[error("Timed out talking to {server} after {after:?}")]
    Timeout {
        /// Backend name.
        server: String,
        /// How long the proxy waited.
        after: Duration,
    },

    /// The backend refused the player.
    #[error("{server} rejected the login: {reason}")]
    Rejected {
        /// Backend name.
        server: String,
        /// Reason sent by the backend, as raw JSON or text.
        reason: String,
    },

    /// The backend closed the connection during login.
    #[error("{server} closed the connection")]
    Closed {
        /// Backend name.
        server: String,
    },

    /// The backend sent something the proxy could not parse.
    #[error("Protocol error from backend: {0}")]
    Protocol(#[from] ProtocolError),

    /// Identity forwarding could not be completed.
    #[error("Forwarding error: {0}")]
    Forwarding(String),
}

/// Errors that end a connection or a session.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The byte stream could not be split into packets.
    #[error("Framing error: {0}")]
    Framing(ProtocolError),

    /// A packet was illegal for the protocol state it arrived in.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(ProtocolError),

    /// No backend could take the player.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(#[from] BackendError),

    /// A backend switch did not complete in time.
    #[error("Backend switch timed out after {0:?}")]
    BackendSwitchTimeout(Duration),

    /// A bounded queue overflowed under a policy that forbids dropping.
    #[error("Queue overflow: {0}")]
    QueueOverflow(&'static str),

    /// The consumer of an event pipeline went away.
    #[error("Event pipeline closed")]
    PipelineClosed,

    /// The connection is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The proxy turned a login away.
    #[error("Login refused: {0}")]
    LoginRefused(String),

    /// A switch request was refused before it started.
    #[error("Switch rejected: {0}")]
    SwitchRejected(String),

    /// Client authentication failed.
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for ProxyError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => Self::Io(e),
            e if e.is_framing() => Self::Framing(e),
            e => Self::ProtocolViolation(e),
        }
    }
}

impl ProxyError {
    /// Text shown to a player disconnected because of this error.
    #[must_use]
    pub fn disconnect_message(&self) -> String {
        match self {
            Self::Framing(_) | Self::ProtocolViolation(_) => {
                "Disconnected: protocol error".to_string()
            }
            Self::BackendUnavailable(BackendError::Rejected { reason, .. }) => {
                format!("Could not join the server: {reason}")
            }
            Self::BackendUnavailable(_) => "No server is available to join".to_string(),
            Self::BackendSwitchTimeout(_) => "Timed out while switching servers".to_string(),
            Self::QueueOverflow(_) => "Disconnected: connection overloaded".to_string(),
            Self::LoginRefused(reason) | Self::SwitchRejected(reason) => reason.clone(),
            Self::Auth(_) => "Failed to verify username!".to_string(),
            Self::PipelineClosed | Self::ConnectionClosed | Self::Io(_) => {
                "Disconnected".to_string()
            }
        }
    }
}

/// Result type alias using [`ProxyError`].
pub type Result<T> = std::result::Result<T, ProxyError>;

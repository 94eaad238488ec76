//! Error types for the tether daemon.

use std::time::Duration;

use tether_rpc::{CodecError, DecodeError, ErrorPayload, IdentityError, TransportError};

use crate::state::ConnectionState;

/// Errors surfaced by a [`Connection`](crate::Connection).
///
/// Decode and unmatched-response errors are returned for observability only;
/// they never change the connection's state.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection went away before the operation completed
    #[error("No longer connected to client")]
    NoLongerConnected,

    /// A caller-supplied deadline elapsed
    #[error("Request timeout")]
    Timeout,

    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// The capability query did not complete in time
    #[error("Initialization timed out after {0:?}")]
    InitializationTimeout(Duration),

    /// A response arrived for an id nobody is waiting on
    #[error("Unmatched response id: {0}")]
    UnmatchedResponse(u64),

    /// Malformed inbound frame
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The remote answered with an error
    #[error("Remote error: {0}")]
    Remote(ErrorPayload),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: expected {expected}, was {actual}")]
    InvalidState {
        expected: ConnectionState,
        actual: ConnectionState,
    },

    /// Plugin calls require the plugin to be started on the remote
    #[error("Client is not accepting messages for plugin {0}")]
    PluginNotActive(String),

    /// A start command was already sent for this plugin
    #[error("Plugin {0} already started")]
    DuplicatePluginStart(String),

    /// Writing to the transport failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A response payload did not have the expected shape
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl ConnectionError {
    /// Whether the error means the connection itself is gone.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::NoLongerConnected | Self::InitializationTimeout(_) | Self::Transport(_)
        )
    }
}

/// Errors that can occur in the daemon
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Frame codec error
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Invalid client identity
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

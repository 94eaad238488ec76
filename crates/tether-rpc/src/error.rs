//! Error types for the tether-rpc crate.

/// A frame that could not be turned into an [`Envelope`](crate::Envelope).
///
/// Decode errors are never fatal to a connection: the frame is logged and
/// dropped.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Envelope is not a JSON object")]
    NotAnObject,

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Response {0} has both success and error")]
    AmbiguousResponse(u64),

    #[error("Envelope has neither id nor method")]
    MissingMethod,
}

impl DecodeError {
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure to hand a frame to the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DecodeError>;

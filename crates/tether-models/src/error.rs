//! Model validation errors.

use thiserror::Error;

pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while validating or decoding pipeline data.
///
/// Every variant here is a validation failure: retrying the same input
/// cannot succeed.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Unsupported schema version {found} (supported 1..={supported})")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid payload for {message_type}: {reason}")]
    InvalidPayload { message_type: String, reason: String },

    #[error("Payload is an external reference and must be resolved first: {0}")]
    UnresolvedPayload(String),
}

impl ModelError {
    pub fn invalid_envelope(msg: impl Into<String>) -> Self {
        Self::InvalidEnvelope(msg.into())
    }

    pub fn invalid_payload(message_type: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message_type: message_type.into(),
            reason: reason.into(),
        }
    }
}

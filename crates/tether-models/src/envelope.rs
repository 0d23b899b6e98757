//! Message envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ModelError, ModelResult};
use crate::ids::{IdempotencyKey, MessageId};
use crate::message::MessageBody;

/// Highest envelope schema version this build understands.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Pointer to a payload or artifact held in external blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub uri: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the stored bytes
    pub sha256: String,
}

/// Envelope payload: inline JSON, or a reference to external storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Inline(Value),
    Reference(BlobRef),
}

impl Payload {
    pub fn is_reference(&self) -> bool {
        matches!(self, Payload::Reference(_))
    }
}

/// Transport-independent message wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub message_type: String,
    pub message_id: MessageId,
    /// Shared by every message descending from the same originating request
    pub correlation_id: String,
    /// `message_id` of the message that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub idempotency_key: IdempotencyKey,
    /// Business entity the message is about (a job id, an order id, ...)
    pub subject: String,
    pub created_at: DateTime<Utc>,
    pub payload: Payload,
}

impl Envelope {
    /// Build a current-version envelope for `body`, starting a new correlation chain.
    pub fn new(body: &MessageBody, subject: impl Into<String>) -> ModelResult<Self> {
        let message_id = MessageId::new();
        Ok(Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            message_type: body.message_type().to_string(),
            correlation_id: message_id.to_string(),
            message_id,
            causation_id: None,
            idempotency_key: body.idempotency_key(),
            subject: subject.into(),
            created_at: Utc::now(),
            payload: Payload::Inline(body.to_value()?),
        })
    }

    /// Link this envelope to the message that produced it.
    pub fn caused_by(mut self, parent: &Envelope) -> Self {
        self.correlation_id = parent.correlation_id.clone();
        self.causation_id = Some(parent.message_id.to_string());
        self
    }

    /// Structural checks that do not need the payload decoded.
    pub fn validate(&self) -> ModelResult<()> {
        if self.schema_version == 0 || self.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(ModelError::UnsupportedSchemaVersion {
                found: self.schema_version,
                supported: CURRENT_SCHEMA_VERSION,
            });
        }
        if self.message_type.trim().is_empty() {
            return Err(ModelError::invalid_envelope("message_type is empty"));
        }
        if self.idempotency_key.is_empty() {
            return Err(ModelError::invalid_envelope("idempotency_key is empty"));
        }
        if self.correlation_id.trim().is_empty() {
            return Err(ModelError::invalid_envelope("correlation_id is empty"));
        }
        Ok(())
    }

    /// Decode the inline payload into its typed body.
    pub fn body(&self) -> ModelResult<MessageBody> {
        match &self.payload {
            Payload::Inline(value) => MessageBody::decode(&self.message_type, value),
            Payload::Reference(blob) => Err(ModelError::UnresolvedPayload(blob.uri.clone())),
        }
    }

    /// Serialized size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        match &self.payload {
            Payload::Inline(value) => serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0),
            Payload::Reference(_) => 0,
        }
    }
}

//! Queue error types.

use tether_models::ModelError;
use tether_storage::StorageError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Dequeue failed: {0}")]
    DequeueFailed(String),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    #[error("Batch too large: {reason}")]
    BatchTooLarge { reason: String },

    #[error("Invalid envelope: {0}")]
    Invalid(#[from] ModelError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn dequeue_failed(msg: impl Into<String>) -> Self {
        Self::DequeueFailed(msg.into())
    }

    pub fn batch_too_large(reason: impl Into<String>) -> Self {
        Self::BatchTooLarge {
            reason: reason.into(),
        }
    }

    /// Whether the broker call may succeed if repeated.
    pub fn is_retryable(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_)
            | QueueError::EnqueueFailed(_)
            | QueueError::DequeueFailed(_)
            | QueueError::Redis(_) => true,
            QueueError::Storage(e) => e.is_retryable(),
            _ => false,
        }
    }
}

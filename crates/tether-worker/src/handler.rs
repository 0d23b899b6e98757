//! Message handlers.
//!
//! A handler performs the action a message asks for. The dispatcher has
//! already reserved the message's idempotency key, so a handler only needs to
//! be safe to re-run after a crash before its result was committed.

use async_trait::async_trait;
use serde_json::Value;
use tether_models::{Envelope, ErrorClass, JobId, MessageBody, ModelError};
use tether_queue::QueueError;
use tether_storage::StorageError;
use tether_store::{EffectError, StoreError};
use thiserror::Error;

use crate::error::WorkerError;

pub type HandlerResult = Result<Value, HandlerError>;

/// A decoded, validated message.
#[derive(Debug, Clone)]
pub struct Message {
    pub envelope: Envelope,
    pub body: MessageBody,
    /// 1-based delivery attempt
    pub attempt: u32,
}

impl Message {
    pub fn job_id(&self) -> Option<&JobId> {
        self.body.job_id()
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Business failure: {0}")]
    BusinessTerminal(String),

    #[error("Engine fatal: {0}")]
    EngineFatal(String),

    /// Not processable yet (e.g. a sequence gap); redeliver later without
    /// spending the retry budget
    #[error("Deferred: {0}")]
    Defer(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn business(msg: impl Into<String>) -> Self {
        Self::BusinessTerminal(msg.into())
    }

    pub fn engine_fatal(msg: impl Into<String>) -> Self {
        Self::EngineFatal(msg.into())
    }

    pub fn defer(msg: impl Into<String>) -> Self {
        Self::Defer(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            HandlerError::Transient(_) | HandlerError::Defer(_) => ErrorClass::Transient,
            HandlerError::Validation(_) => ErrorClass::Validation,
            HandlerError::BusinessTerminal(_) => ErrorClass::BusinessTerminal,
            HandlerError::EngineFatal(_) => ErrorClass::EngineFatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }
}

impl EffectError for HandlerError {
    fn is_terminal(&self) -> bool {
        self.class() != ErrorClass::Transient
    }
}

impl From<StoreError> for HandlerError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound(_) | StoreError::Conflict { .. } => Self::business(e.to_string()),
            StoreError::Corrupt { .. } => Self::engine_fatal(e.to_string()),
            _ => Self::transient(e.to_string()),
        }
    }
}

impl From<QueueError> for HandlerError {
    fn from(e: QueueError) -> Self {
        if e.is_retryable() {
            Self::transient(e.to_string())
        } else {
            Self::validation(e.to_string())
        }
    }
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        if e.is_retryable() {
            Self::transient(e.to_string())
        } else {
            Self::business(e.to_string())
        }
    }
}

impl From<ModelError> for HandlerError {
    fn from(e: ModelError) -> Self {
        Self::validation(e.to_string())
    }
}

impl From<WorkerError> for HandlerError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::EngineFatal(msg) => Self::EngineFatal(msg),
            WorkerError::Store(e) => e.into(),
            WorkerError::Queue(e) => e.into(),
            WorkerError::Storage(e) => e.into(),
            WorkerError::Model(e) => e.into(),
            WorkerError::Step(e) => match e.class() {
                ErrorClass::Transient => Self::Transient(e.to_string()),
                ErrorClass::Validation => Self::Validation(e.to_string()),
                ErrorClass::BusinessTerminal => Self::BusinessTerminal(e.to_string()),
                ErrorClass::EngineFatal => Self::EngineFatal(e.to_string()),
            },
            other if other.is_retryable() => Self::transient(other.to_string()),
            other => Self::business(other.to_string()),
        }
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> HandlerResult;
}

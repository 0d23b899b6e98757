//! Worker error types.

use tether_models::ModelError;
use tether_queue::QueueError;
use tether_storage::StorageError;
use tether_store::StoreError;
use thiserror::Error;

use crate::orchestrator::StepError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// Orchestrator state cannot be recovered
    #[error("Engine fatal: {0}")]
    EngineFatal(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn engine_fatal(msg: impl Into<String>) -> Self {
        Self::EngineFatal(msg.into())
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkerError::Queue(e) => e.is_retryable(),
            WorkerError::Store(e) => e.is_retryable(),
            WorkerError::Storage(e) => e.is_retryable(),
            WorkerError::Step(e) => e.is_retryable(),
            _ => false,
        }
    }

    pub fn is_engine_fatal(&self) -> bool {
        matches!(self, WorkerError::EngineFatal(_) | WorkerError::Step(StepError::EngineFatal(_)))
    }
}

//! Workflows and steps.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tether_models::ErrorClass;
use tether_storage::StorageError;
use tether_store::{EffectError, StoreError};
use thiserror::Error;

use super::context::StepContext;

pub type StepResult<T> = Result<T, StepError>;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("Transient step failure: {0}")]
    Transient(String),

    #[error("Step failed: {0}")]
    Terminal(String),

    /// Instance state cannot be trusted
    #[error("Engine fatal: {0}")]
    EngineFatal(String),

    /// Cancel, pause or terminate was observed at a checkpoint
    #[error("Stopped: {0}")]
    Stopped(String),
}

impl StepError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn terminal(msg: impl Into<String>) -> Self {
        Self::Terminal(msg.into())
    }

    pub fn engine_fatal(msg: impl Into<String>) -> Self {
        Self::EngineFatal(msg.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StepError::Transient(_) | StepError::Stopped(_) => ErrorClass::Transient,
            StepError::Terminal(_) => ErrorClass::BusinessTerminal,
            StepError::EngineFatal(_) => ErrorClass::EngineFatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }
}

impl EffectError for StepError {
    fn is_terminal(&self) -> bool {
        matches!(self, StepError::Terminal(_) | StepError::EngineFatal(_))
    }
}

impl From<StoreError> for StepError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::Corrupt { .. } | StoreError::NotFound(_) => Self::engine_fatal(e.to_string()),
            StoreError::Conflict { .. } => Self::terminal(e.to_string()),
            _ => Self::transient(e.to_string()),
        }
    }
}

impl From<StorageError> for StepError {
    fn from(e: StorageError) -> Self {
        if e.is_retryable() {
            Self::transient(e.to_string())
        } else {
            Self::terminal(e.to_string())
        }
    }
}

impl From<serde_json::Error> for StepError {
    fn from(e: serde_json::Error) -> Self {
        Self::terminal(e.to_string())
    }
}

/// One idempotent unit of a workflow. The engine may run a body more than
/// once before its success is recorded.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &StepContext) -> StepResult<Value>;
}

/// An ordered list of steps, selected by job type.
pub trait Workflow: Send + Sync {
    fn name(&self) -> &str;

    fn steps(&self) -> Vec<Arc<dyn Step>>;

    fn step_names(&self) -> Vec<String> {
        self.steps().iter().map(|s| s.name().to_string()).collect()
    }
}

#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.workflows.insert(workflow.name().to_string(), workflow);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

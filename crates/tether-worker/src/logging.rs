//! Structured job logging.
//!
//! Lifecycle lines for a job (and optionally one of its instances) with
//! consistent fields, plus a span for nesting step-level events.

use tether_models::{InstanceId, JobId};
use tracing::{error, info, warn, Span};

#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    instance_id: String,
    operation: String,
}

impl JobLogger {
    pub fn new(job_id: &JobId, operation: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            instance_id: String::new(),
            operation: operation.to_string(),
        }
    }

    /// Logger scoped to one orchestrator instance.
    pub fn for_instance(instance_id: &InstanceId, job_id: &JobId, operation: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            ..Self::new(job_id, operation)
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            operation = %self.operation,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            operation = %self.operation,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            operation = %self.operation,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            operation = %self.operation,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            operation = %self.operation,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_logger_keeps_job() {
        let job_id = JobId::from_string("j1");
        let instance_id = InstanceId::for_shard(&job_id, 2);
        let logger = JobLogger::for_instance(&instance_id, &job_id, "orchestrate");

        assert_eq!(logger.job_id(), "j1");
        assert_eq!(logger.operation(), "orchestrate");
        logger.log_progress("batch 1");
    }
}

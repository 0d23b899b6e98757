//! Control plane: operator cancel, pause and resume.
//!
//! Intent is made durable on the job record before any instance is touched,
//! so a command that fails halfway is safe to redeliver. Every applied or
//! ignored command leaves an audit entry.

use std::sync::Arc;

use chrono::Utc;
use tether_models::{
    AuditEntry, ControlAction, ControlJob, InstanceRecord, JobId, JobRecord, JobStatus,
    TransitionOutcome,
};
use tether_store::{AuditLog, InstanceStore, JobRecordStore};
use tracing::{info, warn};

use crate::handler::HandlerError;
use crate::orchestrator::Engine;

const APPLIED: &str = "applied";
const NOOP_TERMINAL: &str = "noop:terminal";

pub struct ControlPlane {
    jobs: Arc<dyn JobRecordStore>,
    instances: Arc<dyn InstanceStore>,
    engine: Arc<Engine>,
    audit: Arc<dyn AuditLog>,
}

impl ControlPlane {
    pub fn new(
        jobs: Arc<dyn JobRecordStore>,
        instances: Arc<dyn InstanceStore>,
        engine: Arc<Engine>,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            jobs,
            instances,
            engine,
            audit,
        }
    }

    /// Apply one control command and record it.
    pub async fn apply(&self, command: &ControlJob) -> Result<AuditEntry, HandlerError> {
        let job = self
            .jobs
            .get(&command.job_id)
            .await?
            .ok_or_else(|| HandlerError::business(format!("unknown job {}", command.job_id)))?;

        if job.status.is_terminal() {
            info!(
                job_id = %command.job_id,
                action = %command.action,
                status = %job.status,
                "Control command on finished job ignored"
            );
            return self.record(command, NOOP_TERMINAL.to_string(), Vec::new()).await;
        }

        let (outcome, touched) = match command.action {
            ControlAction::Cancel => self.cancel(&job, command).await?,
            ControlAction::Pause => self.pause(&job).await?,
            ControlAction::Resume => self.resume(&job).await?,
        };
        info!(
            job_id = %command.job_id,
            action = %command.action,
            request_id = %command.request_id,
            outcome = %outcome,
            instances = touched.len(),
            "Applied control command"
        );
        self.record(command, outcome, touched).await
    }

    /// Audit trail for a job, oldest first.
    pub async fn history(&self, job_id: &JobId) -> Result<Vec<AuditEntry>, HandlerError> {
        Ok(self.audit.list(job_id).await?)
    }

    async fn cancel(&self, job: &JobRecord, command: &ControlJob) -> Result<(String, Vec<String>), HandlerError> {
        self.jobs
            .set_cancel_requested(&job.job_id, command.reason.as_deref())
            .await?;

        let active = self.active_instances(&job.job_id).await?;
        let mut touched = Vec::with_capacity(active.len());
        for instance in &active {
            if let Err(e) = self.engine.terminate(&instance.instance_id).await {
                warn!(
                    job_id = %job.job_id,
                    instance_id = %instance.instance_id,
                    "Failed to terminate instance: {}", e
                );
                return Err(HandlerError::transient(format!(
                    "terminate {} failed: {}",
                    instance.instance_id, e
                )));
            }
            touched.push(instance.instance_id.to_string());
        }

        // No live instance is left to finalize the job.
        if active.is_empty() {
            self.jobs.transition_status(&job.job_id, JobStatus::Cancelled).await?;
        }
        Ok((APPLIED.to_string(), touched))
    }

    async fn pause(&self, job: &JobRecord) -> Result<(String, Vec<String>), HandlerError> {
        if let TransitionOutcome::Rejected { current } =
            self.jobs.transition_status(&job.job_id, JobStatus::Paused).await?
        {
            return Ok((format!("noop:{}", current), Vec::new()));
        }

        let mut touched = Vec::new();
        for instance in self.active_instances(&job.job_id).await? {
            self.engine.pause(&instance.instance_id).await?;
            touched.push(instance.instance_id.to_string());
        }
        Ok((APPLIED.to_string(), touched))
    }

    async fn resume(&self, job: &JobRecord) -> Result<(String, Vec<String>), HandlerError> {
        if let TransitionOutcome::Rejected { current } =
            self.jobs.transition_status(&job.job_id, JobStatus::Running).await?
        {
            return Ok((format!("noop:{}", current), Vec::new()));
        }

        let mut touched = Vec::new();
        for instance in self.active_instances(&job.job_id).await? {
            self.engine.resume(&instance.instance_id).await?;
            touched.push(instance.instance_id.to_string());
        }
        Ok((APPLIED.to_string(), touched))
    }

    async fn active_instances(&self, job_id: &JobId) -> Result<Vec<InstanceRecord>, HandlerError> {
        Ok(self
            .instances
            .list_by_job(job_id)
            .await?
            .into_iter()
            .filter(|i| !i.status.is_terminal())
            .collect())
    }

    async fn record(
        &self,
        command: &ControlJob,
        outcome: String,
        instances: Vec<String>,
    ) -> Result<AuditEntry, HandlerError> {
        let entry = AuditEntry {
            job_id: command.job_id.clone(),
            action: command.action,
            request_id: command.request_id.clone(),
            requested_by: command.requested_by.clone(),
            reason: command.reason.clone(),
            outcome,
            instances,
            recorded_at: Utc::now(),
        };
        self.audit.append(&entry).await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;
    use tether_models::{ErrorClass, InstanceId, InstanceSignal};
    use tether_storage::InMemoryBlobStore;
    use tether_store::{
        InMemoryAuditLog, InMemoryInstanceStore, InMemoryJobStore, InMemoryLedger, StoreError, StoreResult,
    };

    use crate::config::EngineConfig;
    use crate::orchestrator::{ArchiveWorkflow, WorkflowRegistry, ARCHIVE_JOB_TYPE};

    /// Instance store whose signal writes always fail.
    struct SignalsDown {
        inner: InMemoryInstanceStore,
    }

    #[async_trait]
    impl InstanceStore for SignalsDown {
        async fn create(&self, record: &InstanceRecord) -> StoreResult<bool> {
            self.inner.create(record).await
        }

        async fn get(&self, instance_id: &InstanceId) -> StoreResult<Option<InstanceRecord>> {
            self.inner.get(instance_id).await
        }

        async fn save(&self, record: &InstanceRecord) -> StoreResult<()> {
            self.inner.save(record).await
        }

        async fn list_by_job(&self, job_id: &JobId) -> StoreResult<Vec<InstanceRecord>> {
            self.inner.list_by_job(job_id).await
        }

        async fn list_active(&self) -> StoreResult<Vec<InstanceRecord>> {
            self.inner.list_active().await
        }

        async fn set_signal(&self, _instance_id: &InstanceId, _signal: InstanceSignal) -> StoreResult<InstanceSignal> {
            Err(StoreError::unavailable("connection reset"))
        }

        async fn signal(&self, instance_id: &InstanceId) -> StoreResult<InstanceSignal> {
            self.inner.signal(instance_id).await
        }

        async fn try_lock(&self, instance_id: &InstanceId, owner: &str, ttl: std::time::Duration) -> StoreResult<bool> {
            self.inner.try_lock(instance_id, owner, ttl).await
        }

        async fn unlock(&self, instance_id: &InstanceId, owner: &str) -> StoreResult<()> {
            self.inner.unlock(instance_id, owner).await
        }
    }

    struct Fixture {
        control: ControlPlane,
        engine: Arc<Engine>,
        jobs: Arc<InMemoryJobStore>,
        audit: Arc<InMemoryAuditLog>,
    }

    fn fixture(instances: Arc<dyn InstanceStore>) -> Fixture {
        let jobs = Arc::new(InMemoryJobStore::new());
        let audit = Arc::new(InMemoryAuditLog::default());
        let engine = Arc::new(Engine::new(
            EngineConfig::default(),
            WorkflowRegistry::new().register(Arc::new(ArchiveWorkflow::default())),
            jobs.clone(),
            instances.clone(),
            Arc::new(InMemoryLedger::default()),
            Arc::new(InMemoryBlobStore::new()),
        ));
        let control = ControlPlane::new(jobs.clone(), instances, engine.clone(), audit.clone());
        Fixture {
            control,
            engine,
            jobs,
            audit,
        }
    }

    fn command(job_id: &JobId, action: ControlAction) -> ControlJob {
        ControlJob {
            job_id: job_id.clone(),
            action,
            request_id: "req-1".to_string(),
            reason: Some("operator".to_string()),
            requested_by: None,
        }
    }

    async fn create_job(jobs: &InMemoryJobStore, instance_count: u32) -> JobId {
        let record = JobRecord::new(JobId::from_string("j1"), ARCHIVE_JOB_TYPE).with_instance_count(instance_count);
        jobs.create(record).await.unwrap().job_id
    }

    #[tokio::test]
    async fn test_failed_terminate_is_transient_and_keeps_cancel_intent() {
        let f = fixture(Arc::new(SignalsDown {
            inner: InMemoryInstanceStore::new(),
        }));
        let job_id = create_job(&f.jobs, 1).await;
        f.engine.register_instance(&job_id, 0, 1, Value::Null).await.unwrap();

        let err = f
            .control
            .apply(&command(&job_id, ControlAction::Cancel))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);

        let job = f.jobs.get(&job_id).await.unwrap().unwrap();
        assert!(job.cancel_requested);
        assert_eq!(job.cancel_reason.as_deref(), Some("operator"));
        assert!(!job.status.is_terminal());
        assert!(f.audit.list(&job_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_without_instances_finalizes_job() {
        let f = fixture(Arc::new(InMemoryInstanceStore::new()));
        let job_id = create_job(&f.jobs, 2).await;

        let entry = f.control.apply(&command(&job_id, ControlAction::Cancel)).await.unwrap();
        assert_eq!(entry.outcome, APPLIED);
        assert!(entry.instances.is_empty());
        assert_eq!(f.jobs.get(&job_id).await.unwrap().unwrap().status, JobStatus::Cancelled);

        let again = f.control.apply(&command(&job_id, ControlAction::Resume)).await.unwrap();
        assert_eq!(again.outcome, NOOP_TERMINAL);
        assert_eq!(f.control.history(&job_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_of_running_job_is_noop() {
        let f = fixture(Arc::new(InMemoryInstanceStore::new()));
        let job_id = create_job(&f.jobs, 1).await;
        f.jobs.transition_status(&job_id, JobStatus::Running).await.unwrap();

        let entry = f.control.apply(&command(&job_id, ControlAction::Resume)).await.unwrap();
        assert_eq!(entry.outcome, "noop:running");
    }

    #[tokio::test]
    async fn test_unknown_job_is_business_error() {
        let f = fixture(Arc::new(InMemoryInstanceStore::new()));
        let err = f
            .control
            .apply(&command(&JobId::from_string("missing"), ControlAction::Pause))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::BusinessTerminal);
    }
}

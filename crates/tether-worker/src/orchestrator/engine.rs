//! Durable step-execution engine.
//!
//! An instance runs its workflow's steps strictly in order. Every transition
//! of a step (running, failed-retrying, succeeded, failed-terminal) is saved
//! before the engine moves on, so a restarted instance resumes at the first
//! step without a recorded success and replays earlier outputs instead of
//! re-running them.
//!
//! The instance record has one writer at a time: whoever holds its run lock.
//! Cancel, pause and terminate are cooperative. They are observed between
//! steps and at checkpoints; a step already in flight may finish first.
//!
//! A failure to persist instance state ends the run without touching the
//! step's outcome, exactly like a crash: the instance is picked up again from
//! its last saved state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde_json::{json, Value};
use tether_models::{
    ErrorClass, IdempotencyKey, InstanceId, InstanceRecord, InstanceSignal, InstanceStatus, JobId, JobRecord,
    JobStatus, LedgerContext, StepExecution, StepOutput, StepStatus, TransitionOutcome,
};
use tether_storage::BlobStore;
use tether_store::{guard, InstanceStore, JobRecordStore, Ledger, StoreError};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::context::{from_guard_error, stop_reason, EngineServices, StepContext, StopReason};
use super::workflow::{Step, StepError, WorkflowRegistry};
use crate::config::EngineConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::retry::RetryPolicy;

/// How one step ended for this run of the instance.
enum StepRun {
    Succeeded,
    /// Stop observed at a checkpoint; the step resumes from its cursor
    Stopped(String),
    Failed(StepError),
}

pub struct Engine {
    services: Arc<EngineServices>,
    registry: WorkflowRegistry,
    owner: String,
    retry_policy: RetryPolicy,
    running: Mutex<HashMap<InstanceId, JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        registry: WorkflowRegistry,
        jobs: Arc<dyn JobRecordStore>,
        instances: Arc<dyn InstanceStore>,
        ledger: Arc<dyn Ledger>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let retry_policy = RetryPolicy::new(config.step_base_delay, config.step_max_delay);
        Self {
            services: Arc::new(EngineServices {
                config,
                jobs,
                instances,
                ledger,
                blobs,
            }),
            registry,
            owner: format!("engine-{}", Uuid::new_v4()),
            retry_policy,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    // =========================================================================
    // Primitives
    // =========================================================================

    /// Register an instance for one shard of a job and start running it.
    /// Idempotent: the instance id is derived from the job and shard.
    pub async fn start_instance(
        self: &Arc<Self>,
        job_id: &JobId,
        shard: u32,
        shard_count: u32,
        parameters: Value,
    ) -> WorkerResult<InstanceId> {
        let instance_id = self
            .register_instance(job_id, shard, shard_count, parameters)
            .await?;
        self.spawn(instance_id.clone()).await;
        Ok(instance_id)
    }

    /// Persist the instance record without running it.
    pub async fn register_instance(
        &self,
        job_id: &JobId,
        shard: u32,
        shard_count: u32,
        parameters: Value,
    ) -> WorkerResult<InstanceId> {
        let job = self.load_job(job_id).await?;
        let Some(workflow) = self.registry.get(&job.job_type) else {
            let reason = format!("no workflow registered for job type {}", job.job_type);
            self.fail_job(job_id, ErrorClass::EngineFatal, &reason).await;
            return Err(WorkerError::engine_fatal(reason));
        };

        let record = InstanceRecord::new(
            job_id.clone(),
            job.job_type.clone(),
            shard,
            shard_count,
            parameters,
            &workflow.step_names(),
        );
        if self.services.instances.create(&record).await? {
            info!(job_id = %job_id, instance_id = %record.instance_id, shard, "Registered instance");
        }
        Ok(record.instance_id)
    }

    /// Ask an instance to stop for good. A running instance stops at its next
    /// checkpoint or step boundary; an idle one is settled immediately.
    pub async fn terminate(&self, instance_id: &InstanceId) -> WorkerResult<()> {
        self.services
            .instances
            .set_signal(instance_id, InstanceSignal::Terminate)
            .await?;
        self.settle_if_idle(instance_id).await
    }

    pub async fn pause(&self, instance_id: &InstanceId) -> WorkerResult<()> {
        let signal = self
            .services
            .instances
            .set_signal(instance_id, InstanceSignal::Pause)
            .await?;
        if signal == InstanceSignal::Terminate {
            debug!(instance_id = %instance_id, "Pause ignored, instance is terminating");
        }
        self.settle_if_idle(instance_id).await
    }

    /// Clear a pause and run the instance again.
    pub async fn resume(self: &Arc<Self>, instance_id: &InstanceId) -> WorkerResult<()> {
        let signal = self
            .services
            .instances
            .set_signal(instance_id, InstanceSignal::None)
            .await?;
        if signal == InstanceSignal::Terminate {
            debug!(instance_id = %instance_id, "Resume ignored, instance is terminating");
            return Ok(());
        }

        let record = self
            .services
            .instances
            .get(instance_id)
            .await?
            .ok_or_else(|| WorkerError::InstanceNotFound(instance_id.to_string()))?;
        if !record.status.is_terminal() {
            self.spawn(instance_id.clone()).await;
        }
        Ok(())
    }

    /// Re-drive every running instance, e.g. after a restart. Paused
    /// instances wait for `resume`.
    pub async fn recover(self: &Arc<Self>) -> WorkerResult<usize> {
        let active: Vec<InstanceRecord> = self
            .services
            .instances
            .list_active()
            .await?
            .into_iter()
            .filter(|r| r.status != InstanceStatus::Paused)
            .collect();
        for record in &active {
            self.spawn(record.instance_id.clone()).await;
        }
        if !active.is_empty() {
            info!(count = active.len(), "Recovering active instances");
        }
        Ok(active.len())
    }

    /// Wait for a locally started instance task to end.
    pub async fn join(&self, instance_id: &InstanceId) {
        let handle = self.running.lock().await.remove(instance_id);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Wait for every locally started instance task to end.
    pub async fn join_all(&self) {
        loop {
            let handles: Vec<JoinHandle<()>> = self.running.lock().await.drain().map(|(_, h)| h).collect();
            if handles.is_empty() {
                return;
            }
            join_all(handles).await;
        }
    }

    async fn spawn(self: &Arc<Self>, instance_id: InstanceId) {
        let mut running = self.running.lock().await;
        running.retain(|_, h| !h.is_finished());
        if running.contains_key(&instance_id) {
            debug!(instance_id = %instance_id, "Instance already running locally");
            return;
        }

        let this = Arc::clone(self);
        let id = instance_id.clone();
        let handle = tokio::spawn(async move {
            this.run_with_retries(&id).await;
            // The entry is ours: a new task for this id is only spawned once
            // this one is gone from the map.
            this.running.lock().await.remove(&id);
        });
        running.insert(instance_id, handle);
    }

    async fn run_with_retries(&self, instance_id: &InstanceId) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_instance(instance_id).await {
                Ok(_) => return,
                Err(e) if e.is_retryable() && attempt < self.services.config.step_max_attempts => {
                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    warn!(instance_id = %instance_id, attempt, "Instance run interrupted, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(instance_id = %instance_id, "Instance run ended with error: {}", e);
                    return;
                }
            }
        }
    }

    // =========================================================================
    // Running an instance
    // =========================================================================

    /// Run an instance to completion, failure or a cooperative stop. Returns
    /// the status it was left in.
    pub async fn run_instance(&self, instance_id: &InstanceId) -> WorkerResult<InstanceStatus> {
        let token = self.run_token();
        let instances = &self.services.instances;
        if !instances
            .try_lock(instance_id, &token, self.services.config.lock_ttl)
            .await?
        {
            debug!(instance_id = %instance_id, "Instance is locked by another runner");
            return Ok(instances
                .get(instance_id)
                .await?
                .map(|r| r.status)
                .unwrap_or_default());
        }

        let result = self.drive(instance_id, &token).await;
        if let Err(e) = instances.unlock(instance_id, &token).await {
            warn!(instance_id = %instance_id, "Failed to release run lock: {}", e);
        }
        result
    }

    async fn drive(&self, instance_id: &InstanceId, token: &str) -> WorkerResult<InstanceStatus> {
        let record = match self.services.instances.get(instance_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(WorkerError::InstanceNotFound(instance_id.to_string())),
            Err(e @ StoreError::Corrupt { .. }) => {
                let reason = format!("instance state is undecodable: {}", e);
                metrics::raise_alert("orchestrator", instance_id.as_str(), &reason);
                if let Some(job_id) = job_of(instance_id) {
                    self.fail_job(&job_id, ErrorClass::EngineFatal, &reason).await;
                }
                return Err(WorkerError::engine_fatal(reason));
            }
            Err(e) => return Err(e.into()),
        };

        if record.status.is_terminal() {
            self.finish_instance(&record).await?;
            return Ok(record.status);
        }

        let logger = JobLogger::for_instance(&record.instance_id, &record.job_id, &record.job_type);
        let span = logger.create_span();
        self.drive_steps(record, token, &logger).instrument(span).await
    }

    async fn drive_steps(
        &self,
        record: InstanceRecord,
        token: &str,
        logger: &JobLogger,
    ) -> WorkerResult<InstanceStatus> {
        let Some(workflow) = self.registry.get(&record.job_type) else {
            let reason = format!("no workflow registered for job type {}", record.job_type);
            return self.abandon(record, &reason).await;
        };
        let steps = workflow.steps();
        let names: Vec<&str> = steps.iter().map(|s| s.name()).collect();
        if names != record.step_names() {
            let reason = format!(
                "persisted steps {:?} no longer match workflow steps {:?}",
                record.step_names(),
                names
            );
            return self.abandon(record, &reason).await;
        }

        let job = self.load_job(&record.job_id).await?;
        let job_id = record.job_id.clone();
        let instance_id = record.instance_id.clone();
        let resume_at = record.resume_index();
        let shared = Arc::new(Mutex::new(record));

        if let Some(reason) = stop_reason(&self.services, &job_id, &instance_id).await? {
            return self.stop(&shared, reason, logger).await;
        }
        self.set_status(&shared, InstanceStatus::Running).await?;
        // Only operator resume moves a paused job back to running.
        if let TransitionOutcome::Applied { .. } = self
            .services
            .jobs
            .transition_status_from(&job_id, JobStatus::Pending, JobStatus::Running)
            .await?
        {
            logger.log_start(&format!("{} steps", steps.len()));
        }
        if resume_at > 0 {
            logger.log_progress(&format!("resuming at step {}", resume_at + 1));
        }

        let mut index = resume_at;
        while index < steps.len() {
            if !self
                .services
                .instances
                .try_lock(&instance_id, token, self.services.config.lock_ttl)
                .await?
            {
                logger.log_warning("run lock lost, leaving instance to its new runner");
                return Ok(InstanceStatus::Running);
            }
            if let Some(reason) = stop_reason(&self.services, &job_id, &instance_id).await? {
                return self.stop(&shared, reason, logger).await;
            }

            match self.run_step(&shared, index, &steps[index], &job, token).await? {
                StepRun::Succeeded => index += 1,
                StepRun::Stopped(detail) => {
                    debug!(step = %steps[index].name(), detail = %detail, "Step stopped cooperatively");
                    // Re-check at the top of the loop; nothing to stop for means the
                    // step simply runs again from its cursor.
                }
                StepRun::Failed(e) => return self.fail_instance(&shared, e, logger).await,
            }
        }

        let snapshot = self.set_status(&shared, InstanceStatus::Completed).await?;
        logger.log_completion(&format!("{} steps succeeded", steps.len()));
        self.finish_instance(&snapshot).await?;
        Ok(InstanceStatus::Completed)
    }

    async fn run_step(
        &self,
        shared: &Arc<Mutex<InstanceRecord>>,
        index: usize,
        step: &Arc<dyn Step>,
        job: &JobRecord,
        token: &str,
    ) -> WorkerResult<StepRun> {
        let outputs = self.load_outputs(shared).await?;
        let config = &self.services.config;

        loop {
            let snapshot = self
                .update_step(shared, index, |exec| {
                    exec.status = StepStatus::Running;
                    exec.attempt_count += 1;
                    exec.started_at.get_or_insert_with(Utc::now);
                })
                .await?;
            let attempt = snapshot.steps[index].attempt_count;
            metrics::record_step_attempt(step.name());
            debug!(step = %step.name(), attempt, "Running step");

            let ctx = StepContext::new(
                Arc::clone(&self.services),
                Arc::clone(shared),
                &snapshot,
                job.total_units,
                index,
                step.name(),
                outputs.clone(),
                token,
            );
            let result = match tokio::time::timeout(config.step_timeout, step.run(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(StepError::transient(format!(
                    "step exceeded timeout of {:?}",
                    config.step_timeout
                ))),
            };

            match result {
                Ok(value) => {
                    let output = self.persist_output(&snapshot, step.name(), value).await?;
                    self.update_step(shared, index, |exec| {
                        exec.status = StepStatus::Succeeded;
                        exec.output = Some(output);
                        exec.last_error = None;
                        exec.finished_at = Some(Utc::now());
                    })
                    .await?;
                    return Ok(StepRun::Succeeded);
                }
                Err(StepError::Stopped(detail)) => return Ok(StepRun::Stopped(detail)),
                Err(e) => {
                    metrics::record_step_failure(step.name(), e.class().as_str());
                    let failures = snapshot.steps[index].failure_count + 1;
                    let retry = e.is_retryable() && failures < config.step_max_attempts;
                    let message = e.to_string();
                    self.update_step(shared, index, |exec| {
                        exec.failure_count = failures;
                        exec.status = if retry {
                            StepStatus::FailedRetrying
                        } else {
                            StepStatus::FailedTerminal
                        };
                        exec.last_error = Some(message);
                        if !retry {
                            exec.finished_at = Some(Utc::now());
                        }
                    })
                    .await?;
                    if !retry {
                        return Ok(StepRun::Failed(e));
                    }

                    let delay = self.retry_policy.delay_for_attempt(failures);
                    warn!(step = %step.name(), attempt, failures, delay_ms = delay.as_millis() as u64, "Step failed, retrying: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    // =========================================================================
    // Instance and job state
    // =========================================================================

    async fn stop(
        &self,
        shared: &Arc<Mutex<InstanceRecord>>,
        reason: StopReason,
        logger: &JobLogger,
    ) -> WorkerResult<InstanceStatus> {
        if reason == StopReason::Paused {
            self.set_status(shared, InstanceStatus::Paused).await?;
            logger.log_progress("paused");
            return Ok(InstanceStatus::Paused);
        }

        let snapshot = self.set_status(shared, InstanceStatus::Terminated).await?;
        logger.log_warning(&format!("stopped: {}", reason));
        self.finish_instance(&snapshot).await?;
        Ok(InstanceStatus::Terminated)
    }

    async fn fail_instance(
        &self,
        shared: &Arc<Mutex<InstanceRecord>>,
        error: StepError,
        logger: &JobLogger,
    ) -> WorkerResult<InstanceStatus> {
        let class = error.class();
        let reason = error.to_string();
        let snapshot = {
            let mut record = shared.lock().await;
            record.status = InstanceStatus::Failed;
            record.last_error = Some(reason.clone());
            record.touch();
            record.clone()
        };
        self.services.instances.save(&snapshot).await?;
        logger.log_error(&reason);

        if class == ErrorClass::EngineFatal {
            metrics::raise_alert("orchestrator", snapshot.instance_id.as_str(), &reason);
        }
        self.fail_job(&snapshot.job_id, class, &reason).await;
        self.finish_instance(&snapshot).await?;
        Ok(InstanceStatus::Failed)
    }

    /// Give up on an instance whose state no longer fits its workflow.
    async fn abandon(&self, mut record: InstanceRecord, reason: &str) -> WorkerResult<InstanceStatus> {
        metrics::raise_alert("orchestrator", record.instance_id.as_str(), reason);
        record.status = InstanceStatus::Failed;
        record.last_error = Some(reason.to_string());
        record.touch();
        self.services.instances.save(&record).await?;
        self.fail_job(&record.job_id, ErrorClass::EngineFatal, reason).await;
        self.finish_instance(&record).await?;
        Ok(InstanceStatus::Failed)
    }

    /// Surface an error on the job and move it to failed. Best effort: the
    /// job may already be terminal.
    async fn fail_job(&self, job_id: &JobId, class: ErrorClass, reason: &str) {
        if let Err(e) = self.services.jobs.record_error(job_id, class, reason).await {
            warn!(job_id = %job_id, "Failed to record job error: {}", e);
        }
        match self.services.jobs.transition_status(job_id, JobStatus::Failed).await {
            Ok(TransitionOutcome::Applied { .. }) => info!(job_id = %job_id, "Job failed"),
            Ok(_) => {}
            Err(e) => warn!(job_id = %job_id, "Failed to mark job failed: {}", e),
        }
    }

    /// Count the instance as finished exactly once, and finalize the job when
    /// it was the last one.
    async fn finish_instance(&self, record: &InstanceRecord) -> WorkerResult<()> {
        let jobs = &self.services.jobs;
        let key = IdempotencyKey::derive(
            "instance-finished",
            &[record.job_id.as_str(), record.instance_id.as_str()],
        );
        let context = LedgerContext {
            job_id: Some(record.job_id.to_string()),
            instance_id: Some(record.instance_id.to_string()),
            ..LedgerContext::default()
        };

        guard(
            self.services.ledger.as_ref(),
            &key,
            record.instance_id.as_str(),
            &context,
            || async move {
                let finished = jobs
                    .mark_instance_finished(&record.job_id, &record.instance_id)
                    .await?;
                Ok::<Value, StepError>(json!(finished))
            },
        )
        .await
        .map_err(from_guard_error)?;

        let job = self.load_job(&record.job_id).await?;
        if job.finished_instances < job.instance_count {
            return Ok(());
        }
        self.finalize_job(&job).await
    }

    async fn finalize_job(&self, job: &JobRecord) -> WorkerResult<()> {
        let target = if job.cancel_requested {
            JobStatus::Cancelled
        } else {
            let instances = self.services.instances.list_by_job(&job.job_id).await?;
            if instances.iter().any(|i| i.status == InstanceStatus::Failed) {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            }
        };

        match self.services.jobs.transition_status(&job.job_id, target).await? {
            TransitionOutcome::Applied { from } => {
                JobLogger::new(&job.job_id, &job.job_type).log_completion(&format!("{} -> {}", from, target));
            }
            TransitionOutcome::Unchanged => {}
            TransitionOutcome::Rejected { current } => {
                debug!(job_id = %job.job_id, current = %current, target = %target, "Job already finalized");
            }
        }
        Ok(())
    }

    /// Apply a pending pause or termination to an instance nobody is running.
    async fn settle_if_idle(&self, instance_id: &InstanceId) -> WorkerResult<()> {
        let token = self.run_token();
        let instances = &self.services.instances;
        if !instances
            .try_lock(instance_id, &token, self.services.config.lock_ttl)
            .await?
        {
            return Ok(());
        }

        let result = self.settle(instance_id).await;
        if let Err(e) = instances.unlock(instance_id, &token).await {
            warn!(instance_id = %instance_id, "Failed to release run lock: {}", e);
        }
        result
    }

    async fn settle(&self, instance_id: &InstanceId) -> WorkerResult<()> {
        let Some(mut record) = self.services.instances.get(instance_id).await? else {
            return Err(WorkerError::InstanceNotFound(instance_id.to_string()));
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        match stop_reason(&self.services, &record.job_id, instance_id).await? {
            Some(StopReason::Paused) if record.status == InstanceStatus::Running => {
                record.status = InstanceStatus::Paused;
                record.touch();
                self.services.instances.save(&record).await?;
            }
            Some(StopReason::Paused) | None => {}
            Some(_) => {
                record.status = InstanceStatus::Terminated;
                record.touch();
                self.services.instances.save(&record).await?;
                self.finish_instance(&record).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn run_token(&self) -> String {
        format!("{}:{}", self.owner, Uuid::new_v4())
    }

    async fn load_job(&self, job_id: &JobId) -> WorkerResult<JobRecord> {
        self.services
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job {}", job_id)).into())
    }

    async fn set_status(
        &self,
        shared: &Arc<Mutex<InstanceRecord>>,
        status: InstanceStatus,
    ) -> WorkerResult<InstanceRecord> {
        let snapshot = {
            let mut record = shared.lock().await;
            record.status = status;
            record.touch();
            record.clone()
        };
        self.services.instances.save(&snapshot).await?;
        Ok(snapshot)
    }

    async fn update_step<F>(
        &self,
        shared: &Arc<Mutex<InstanceRecord>>,
        index: usize,
        apply: F,
    ) -> WorkerResult<InstanceRecord>
    where
        F: FnOnce(&mut StepExecution),
    {
        let snapshot = {
            let mut record = shared.lock().await;
            let exec = record
                .steps
                .get_mut(index)
                .ok_or_else(|| WorkerError::engine_fatal(format!("step index {} out of range", index)))?;
            apply(exec);
            record.touch();
            record.clone()
        };
        self.services.instances.save(&snapshot).await?;
        Ok(snapshot)
    }

    async fn persist_output(&self, record: &InstanceRecord, step_name: &str, value: Value) -> WorkerResult<StepOutput> {
        let bytes = serde_json::to_vec(&value).map_err(StepError::from)?;
        if bytes.len() <= self.services.config.max_output_bytes {
            return Ok(StepOutput::Inline(value));
        }

        let key = format!("outputs/{}/{}/{}.json", record.job_id, record.instance_id, step_name);
        let blob = self.services.blobs.put(&key, bytes, "application/json").await?;
        debug!(step = %step_name, uri = %blob.uri, "Stored large step output");
        Ok(StepOutput::Pointer(blob))
    }

    async fn load_outputs(&self, shared: &Arc<Mutex<InstanceRecord>>) -> WorkerResult<HashMap<String, Value>> {
        let steps = shared.lock().await.steps.clone();
        let mut outputs = HashMap::new();
        for exec in steps {
            if exec.status != StepStatus::Succeeded {
                continue;
            }
            let value = match exec.output {
                Some(StepOutput::Inline(value)) => value,
                Some(StepOutput::Pointer(blob)) => {
                    serde_json::from_slice(&self.services.blobs.get(&blob).await?).map_err(StepError::from)?
                }
                None => Value::Null,
            };
            outputs.insert(exec.step_name, value);
        }
        Ok(outputs)
    }
}

/// Job id embedded in a shard instance id.
fn job_of(instance_id: &InstanceId) -> Option<JobId> {
    instance_id
        .as_str()
        .rsplit_once(":shard-")
        .map(|(job, _)| JobId::from_string(job))
}

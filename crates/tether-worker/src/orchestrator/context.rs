//! What a step sees while it runs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::{json, Value};
use tether_models::{
    IdempotencyKey, InstanceId, InstanceRecord, InstanceSignal, JobId, JobStatus, LedgerContext, ProgressDelta,
};
use tether_storage::BlobStore;
use tether_store::{guard, GuardError, InstanceStore, JobRecordStore, Ledger, StoreError, StoreResult};
use tokio::sync::Mutex;
use tracing::debug;

use super::workflow::{StepError, StepResult};
use crate::config::EngineConfig;
use crate::metrics;

/// Stores and settings shared by the engine and every step context.
pub(crate) struct EngineServices {
    pub config: EngineConfig,
    pub jobs: Arc<dyn JobRecordStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub ledger: Arc<dyn Ledger>,
    pub blobs: Arc<dyn BlobStore>,
}

/// Why an instance should stop starting new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StopReason {
    Terminated,
    Cancelled,
    JobFinished(JobStatus),
    Paused,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Terminated => write!(f, "instance terminated"),
            StopReason::Cancelled => write!(f, "job cancel requested"),
            StopReason::JobFinished(status) => write!(f, "job already {}", status),
            StopReason::Paused => write!(f, "paused"),
        }
    }
}

pub(crate) async fn stop_reason(
    services: &EngineServices,
    job_id: &JobId,
    instance_id: &InstanceId,
) -> StoreResult<Option<StopReason>> {
    let signal = services.instances.signal(instance_id).await?;
    if signal == InstanceSignal::Terminate {
        return Ok(Some(StopReason::Terminated));
    }

    let job = services
        .jobs
        .get(job_id)
        .await?
        .ok_or_else(|| StoreError::not_found(format!("job {}", job_id)))?;
    if job.cancel_requested {
        return Ok(Some(StopReason::Cancelled));
    }
    if job.status.is_terminal() {
        return Ok(Some(StopReason::JobFinished(job.status)));
    }
    if signal == InstanceSignal::Pause || job.status == JobStatus::Paused {
        return Ok(Some(StopReason::Paused));
    }
    Ok(None)
}

pub(crate) fn from_guard_error(e: GuardError<StepError>) -> StepError {
    match e {
        GuardError::Store(e) => e.into(),
        GuardError::InProgress { key } => StepError::transient(format!("{} is in progress elsewhere", key)),
        GuardError::AlreadyFailed { error, .. } => StepError::terminal(error),
        GuardError::Effect(e) => e,
    }
}

/// Context for one attempt of one step.
pub struct StepContext {
    services: Arc<EngineServices>,
    record: Arc<Mutex<InstanceRecord>>,
    job_id: JobId,
    instance_id: InstanceId,
    shard: u32,
    shard_count: u32,
    parameters: Value,
    total_units: u64,
    step_index: usize,
    step_name: String,
    outputs: HashMap<String, Value>,
    run_token: String,
}

impl StepContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        services: Arc<EngineServices>,
        record: Arc<Mutex<InstanceRecord>>,
        snapshot: &InstanceRecord,
        total_units: u64,
        step_index: usize,
        step_name: &str,
        outputs: HashMap<String, Value>,
        run_token: &str,
    ) -> Self {
        Self {
            services,
            record,
            job_id: snapshot.job_id.clone(),
            instance_id: snapshot.instance_id.clone(),
            shard: snapshot.shard,
            shard_count: snapshot.shard_count,
            parameters: snapshot.parameters.clone(),
            total_units,
            step_index,
            step_name: step_name.to_string(),
            outputs,
            run_token: run_token.to_string(),
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Units in the whole job, across all shards.
    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Output of an earlier step in this instance, replayed from storage.
    pub fn output(&self, step_name: &str) -> Option<&Value> {
        self.outputs.get(step_name)
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.services.blobs.as_ref()
    }

    /// Idempotency key for a side effect of this step.
    pub fn ledger_key(&self, suffix: &str) -> IdempotencyKey {
        let shard = self.shard.to_string();
        IdempotencyKey::derive(
            "step",
            &[
                self.job_id.as_str(),
                self.instance_id.as_str(),
                self.step_name.as_str(),
                shard.as_str(),
                suffix,
            ],
        )
    }

    /// Run `effect` at most once for `suffix`, replaying its recorded result
    /// on later attempts.
    pub async fn guard<F, Fut>(&self, suffix: &str, effect: F) -> StepResult<Value>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StepResult<Value>>,
    {
        let key = self.ledger_key(suffix);
        let context = LedgerContext {
            job_id: Some(self.job_id.to_string()),
            instance_id: Some(self.instance_id.to_string()),
            ..LedgerContext::default()
        };

        guard(
            self.services.ledger.as_ref(),
            &key,
            self.instance_id.as_str(),
            &context,
            effect,
        )
        .await
        .map(|guarded| guarded.into_value())
        .map_err(from_guard_error)
    }

    /// Position recorded by the last checkpoint of this step.
    pub async fn cursor(&self) -> Option<u64> {
        let record = self.record.lock().await;
        record.steps.get(self.step_index).and_then(|s| s.cursor)
    }

    /// Record a finished sub-batch: add its counters to the job (once), move
    /// the cursor past it and check whether to keep going.
    ///
    /// Returns `StepError::Stopped` when the job was cancelled or paused, or
    /// the instance was told to terminate.
    pub async fn checkpoint(&self, batch_index: u64, delta: ProgressDelta) -> StepResult<()> {
        let token = format!("{}/{}/{}", self.instance_id, self.step_name, batch_index);
        let delta = delta.at_checkpoint(token);
        let jobs = &self.services.jobs;
        let job_id = &self.job_id;

        let recorded = self
            .guard(&format!("checkpoint-{}", batch_index), || async move {
                let applied = jobs.update_progress(job_id, &delta).await?;
                Ok(json!({ "applied": applied }))
            })
            .await?;
        metrics::record_checkpoint(recorded.get("applied").and_then(Value::as_bool).unwrap_or(false));

        let snapshot = {
            let mut record = self.record.lock().await;
            if let Some(step) = record.steps.get_mut(self.step_index) {
                step.cursor = Some(batch_index + 1);
            }
            record.touch();
            record.clone()
        };
        self.services.instances.save(&snapshot).await?;
        debug!(
            job_id = %self.job_id,
            instance_id = %self.instance_id,
            step = %self.step_name,
            batch_index,
            "Checkpoint recorded"
        );

        let locked = self
            .services
            .instances
            .try_lock(&self.instance_id, &self.run_token, self.services.config.lock_ttl)
            .await?;
        if !locked {
            return Err(StepError::Stopped("run lock lost".to_string()));
        }

        match stop_reason(&self.services, &self.job_id, &self.instance_id).await? {
            Some(reason) => Err(StepError::Stopped(reason.to_string())),
            None => Ok(()),
        }
    }

    /// True when no new side-effecting work should start.
    pub async fn should_stop(&self) -> StepResult<bool> {
        Ok(stop_reason(&self.services, &self.job_id, &self.instance_id)
            .await?
            .is_some())
    }

    pub async fn set_result_pointer(&self, pointer: &str) -> StepResult<()> {
        self.services.jobs.set_result_pointer(&self.job_id, pointer).await?;
        Ok(())
    }
}

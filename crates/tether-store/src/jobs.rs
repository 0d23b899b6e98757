//! Job record store.
//!
//! The single authoritative place for job state. Writers from many
//! processes (orchestrator instances, control plane) only touch a record
//! through atomic operations: counter increments, guarded transitions and
//! flag sets. There is no read-modify-write of whole records.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tether_models::{ErrorClass, InstanceId, JobId, JobRecord, JobStatus, JobStatusView, ProgressDelta, TransitionOutcome};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

#[async_trait]
pub trait JobRecordStore: Send + Sync {
    /// Create the record if absent. Returns the stored record, which is the
    /// pre-existing one when `job_id` is already known.
    async fn create(&self, record: JobRecord) -> StoreResult<JobRecord>;

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>>;

    /// Read-only view for external callers.
    async fn get_status(&self, job_id: &JobId) -> StoreResult<Option<JobStatusView>> {
        Ok(self.get(job_id).await?.map(|record| record.view()))
    }

    /// Atomically add `delta` to the counters. With a checkpoint token the
    /// delta is applied at most once; returns false when it was a repeat.
    async fn update_progress(&self, job_id: &JobId, delta: &ProgressDelta) -> StoreResult<bool>;

    /// Durably raise the cancel flag (idempotent).
    async fn set_cancel_requested(&self, job_id: &JobId, reason: Option<&str>) -> StoreResult<()>;

    /// Guarded status change; terminal statuses never change.
    async fn transition_status(&self, job_id: &JobId, to: JobStatus) -> StoreResult<TransitionOutcome>;

    /// Guarded status change that only applies when the job is currently in
    /// `from` (or already in `to`).
    async fn transition_status_from(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> StoreResult<TransitionOutcome>;

    async fn set_total_units(&self, job_id: &JobId, total_units: u64) -> StoreResult<()>;

    async fn set_result_pointer(&self, job_id: &JobId, pointer: &str) -> StoreResult<()>;

    /// Keep the most severe error. Returns true when the summary changed.
    async fn record_error(&self, job_id: &JobId, class: ErrorClass, message: &str) -> StoreResult<bool>;

    /// Count `instance_id` as finished (idempotent per instance). Returns the
    /// number of distinct finished instances.
    async fn mark_instance_finished(&self, job_id: &JobId, instance_id: &InstanceId) -> StoreResult<u32>;
}

#[derive(Default)]
struct JobState {
    records: HashMap<JobId, JobRecord>,
    checkpoints: HashMap<JobId, HashSet<String>>,
    finished: HashMap<JobId, HashSet<InstanceId>>,
}

/// Process-local job store; a single mutex stands in for per-row atomicity.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<JobState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(job_id: &JobId) -> StoreError {
    StoreError::not_found(format!("job {}", job_id))
}

#[async_trait]
impl JobRecordStore for InMemoryJobStore {
    async fn create(&self, record: JobRecord) -> StoreResult<JobRecord> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.records.get(&record.job_id) {
            debug!(job_id = %record.job_id, "Job record already exists");
            return Ok(existing.clone());
        }
        info!(job_id = %record.job_id, job_type = %record.job_type, "Created job record");
        state.records.insert(record.job_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        Ok(self.state.lock().await.records.get(job_id).cloned())
    }

    async fn update_progress(&self, job_id: &JobId, delta: &ProgressDelta) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(job_id) {
            return Err(missing(job_id));
        }

        if let Some(token) = &delta.checkpoint {
            let fresh = state
                .checkpoints
                .entry(job_id.clone())
                .or_default()
                .insert(token.clone());
            if !fresh {
                debug!(job_id = %job_id, checkpoint = %token, "Progress checkpoint already applied");
                return Ok(false);
            }
        }

        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        record.apply_progress(delta);
        Ok(true)
    }

    async fn set_cancel_requested(&self, job_id: &JobId, reason: Option<&str>) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        record.request_cancel(reason.map(str::to_string));
        Ok(())
    }

    async fn transition_status(&self, job_id: &JobId, to: JobStatus) -> StoreResult<TransitionOutcome> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        Ok(record.transition(to))
    }

    async fn transition_status_from(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> StoreResult<TransitionOutcome> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        Ok(record.transition_from(from, to))
    }

    async fn set_total_units(&self, job_id: &JobId, total_units: u64) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        record.total_units = total_units;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn set_result_pointer(&self, job_id: &JobId, pointer: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        record.result_pointer = Some(pointer.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn record_error(&self, job_id: &JobId, class: ErrorClass, message: &str) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        Ok(record.record_error(class, message))
    }

    async fn mark_instance_finished(&self, job_id: &JobId, instance_id: &InstanceId) -> StoreResult<u32> {
        let mut state = self.state.lock().await;
        if !state.records.contains_key(job_id) {
            return Err(missing(job_id));
        }
        let finished = state.finished.entry(job_id.clone()).or_default();
        finished.insert(instance_id.clone());
        let count = finished.len() as u32;

        let record = state.records.get_mut(job_id).ok_or_else(|| missing(job_id))?;
        record.finished_instances = count;
        record.updated_at = Utc::now();
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn job(id: &str) -> JobRecord {
        JobRecord::new(JobId::from_string(id), "render").with_total_units(100)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = InMemoryJobStore::new();
        let first = store.create(job("j1")).await.unwrap();
        store
            .update_progress(&first.job_id, &ProgressDelta::units(5, 0))
            .await
            .unwrap();

        let again = store.create(job("j1")).await.unwrap();
        assert_eq!(again.processed_units, 5);
    }

    #[tokio::test]
    async fn test_concurrent_progress_is_not_lossy() {
        let store = Arc::new(InMemoryJobStore::new());
        let job_id = store.create(job("j1")).await.unwrap().job_id;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            let job_id = job_id.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    store
                        .update_progress(&job_id, &ProgressDelta::units(1, 0))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.processed_units, 100);
        assert_eq!(record.succeeded_units, 100);
    }

    #[tokio::test]
    async fn test_checkpoint_applies_once() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(job("j1")).await.unwrap().job_id;
        let delta = ProgressDelta::units(8, 2).at_checkpoint("shard-0/batch-3");

        assert!(store.update_progress(&job_id, &delta).await.unwrap());
        assert!(!store.update_progress(&job_id, &delta).await.unwrap());

        let view = store.get_status(&job_id).await.unwrap().unwrap();
        assert_eq!(view.processed_units, 10);
        assert_eq!(view.failed_units, 2);
    }

    #[tokio::test]
    async fn test_terminal_transition_is_final() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(job("j1")).await.unwrap().job_id;

        store.transition_status(&job_id, JobStatus::Running).await.unwrap();
        store.transition_status(&job_id, JobStatus::Cancelled).await.unwrap();

        assert_eq!(
            store.transition_status(&job_id, JobStatus::Cancelled).await.unwrap(),
            TransitionOutcome::Unchanged
        );
        assert!(store
            .transition_status(&job_id, JobStatus::Running)
            .await
            .unwrap()
            .is_rejected());
        assert_eq!(
            store.get(&job_id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_transition_from_only_leaves_the_given_status() {
        let store = InMemoryJobStore::new();
        let job_id = store.create(job("j1")).await.unwrap().job_id;
        store.transition_status(&job_id, JobStatus::Paused).await.unwrap();

        let outcome = store
            .transition_status_from(&job_id, JobStatus::Pending, JobStatus::Running)
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Rejected { current: JobStatus::Paused });
        assert_eq!(store.get(&job_id).await.unwrap().unwrap().status, JobStatus::Paused);

        store.transition_status(&job_id, JobStatus::Running).await.unwrap();
        assert_eq!(
            store
                .transition_status_from(&job_id, JobStatus::Pending, JobStatus::Running)
                .await
                .unwrap(),
            TransitionOutcome::Unchanged
        );
    }

    #[tokio::test]
    async fn test_finished_instances_count_distinct() {
        let store = InMemoryJobStore::new();
        let record = store.create(job("j1").with_instance_count(2)).await.unwrap();
        let shard0 = InstanceId::for_shard(&record.job_id, 0);
        let shard1 = InstanceId::for_shard(&record.job_id, 1);

        assert_eq!(store.mark_instance_finished(&record.job_id, &shard0).await.unwrap(), 1);
        assert_eq!(store.mark_instance_finished(&record.job_id, &shard0).await.unwrap(), 1);
        assert_eq!(store.mark_instance_finished(&record.job_id, &shard1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let err = store
            .set_cancel_requested(&JobId::from_string("nope"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get_status(&JobId::from_string("nope")).await.unwrap().is_none());
    }
}

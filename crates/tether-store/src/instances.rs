//! Orchestrator instance store.
//!
//! An instance record has a single writer at a time: whoever holds its run
//! lock. Operator intent (pause, terminate) travels through a separate
//! signal so the control plane never writes the record itself.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tether_models::{InstanceId, InstanceRecord, InstanceSignal, JobId};
use tokio::sync::Mutex;

use crate::error::StoreResult;

#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert the record if absent. Returns true when it was created.
    async fn create(&self, record: &InstanceRecord) -> StoreResult<bool>;

    async fn get(&self, instance_id: &InstanceId) -> StoreResult<Option<InstanceRecord>>;

    /// Overwrite the record. Callers must hold the run lock.
    async fn save(&self, record: &InstanceRecord) -> StoreResult<()>;

    async fn list_by_job(&self, job_id: &JobId) -> StoreResult<Vec<InstanceRecord>>;

    /// Instances whose status is not terminal.
    async fn list_active(&self) -> StoreResult<Vec<InstanceRecord>>;

    /// Merge a new signal into the current one; terminate is sticky.
    async fn set_signal(&self, instance_id: &InstanceId, signal: InstanceSignal) -> StoreResult<InstanceSignal>;

    async fn signal(&self, instance_id: &InstanceId) -> StoreResult<InstanceSignal>;

    /// Acquire or extend the run lock. Returns false if another owner holds it.
    async fn try_lock(&self, instance_id: &InstanceId, owner: &str, ttl: Duration) -> StoreResult<bool>;

    async fn unlock(&self, instance_id: &InstanceId, owner: &str) -> StoreResult<()>;
}

#[derive(Default)]
struct InstanceState {
    records: HashMap<InstanceId, InstanceRecord>,
    signals: HashMap<InstanceId, InstanceSignal>,
    locks: HashMap<InstanceId, (String, Instant)>,
}

#[derive(Default)]
pub struct InMemoryInstanceStore {
    state: Mutex<InstanceState>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn create(&self, record: &InstanceRecord) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        if state.records.contains_key(&record.instance_id) {
            return Ok(false);
        }
        state.records.insert(record.instance_id.clone(), record.clone());
        Ok(true)
    }

    async fn get(&self, instance_id: &InstanceId) -> StoreResult<Option<InstanceRecord>> {
        Ok(self.state.lock().await.records.get(instance_id).cloned())
    }

    async fn save(&self, record: &InstanceRecord) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.records.insert(record.instance_id.clone(), record.clone());
        Ok(())
    }

    async fn list_by_job(&self, job_id: &JobId) -> StoreResult<Vec<InstanceRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| &r.job_id == job_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.shard);
        Ok(records)
    }

    async fn list_active(&self) -> StoreResult<Vec<InstanceRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        records.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(records)
    }

    async fn set_signal(&self, instance_id: &InstanceId, signal: InstanceSignal) -> StoreResult<InstanceSignal> {
        let mut state = self.state.lock().await;
        let current = state.signals.entry(instance_id.clone()).or_default();
        *current = current.merge(signal);
        Ok(*current)
    }

    async fn signal(&self, instance_id: &InstanceId) -> StoreResult<InstanceSignal> {
        let state = self.state.lock().await;
        Ok(state.signals.get(instance_id).copied().unwrap_or_default())
    }

    async fn try_lock(&self, instance_id: &InstanceId, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        match state.locks.get(instance_id) {
            Some((holder, expires)) if holder != owner && *expires > now => Ok(false),
            _ => {
                state
                    .locks
                    .insert(instance_id.clone(), (owner.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn unlock(&self, instance_id: &InstanceId, owner: &str) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        if state
            .locks
            .get(instance_id)
            .is_some_and(|(holder, _)| holder == owner)
        {
            state.locks.remove(instance_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tether_models::InstanceStatus;

    fn instance(job: &str, shard: u32) -> InstanceRecord {
        InstanceRecord::new(
            JobId::from_string(job),
            "render",
            shard,
            2,
            Value::Null,
            &["only".to_string()],
        )
    }

    #[tokio::test]
    async fn test_create_once() {
        let store = InMemoryInstanceStore::new();
        let record = instance("j1", 0);
        assert!(store.create(&record).await.unwrap());
        assert!(!store.create(&record).await.unwrap());
    }

    #[tokio::test]
    async fn test_active_listing_excludes_terminal() {
        let store = InMemoryInstanceStore::new();
        let mut done = instance("j1", 0);
        done.status = InstanceStatus::Completed;
        store.create(&done).await.unwrap();
        store.create(&instance("j1", 1)).await.unwrap();

        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].shard, 1);
        assert_eq!(store.list_by_job(&JobId::from_string("j1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_expiry() {
        let store = InMemoryInstanceStore::new();
        let id = instance("j1", 0).instance_id;

        assert!(store.try_lock(&id, "a", Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_lock(&id, "b", Duration::from_secs(60)).await.unwrap());
        assert!(store.try_lock(&id, "a", Duration::from_secs(60)).await.unwrap());

        store.unlock(&id, "b").await.unwrap();
        assert!(!store.try_lock(&id, "b", Duration::from_secs(60)).await.unwrap());

        store.unlock(&id, "a").await.unwrap();
        assert!(store.try_lock(&id, "b", Duration::ZERO).await.unwrap());
        // zero ttl expires immediately
        assert!(store.try_lock(&id, "c", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_signal_merge() {
        let store = InMemoryInstanceStore::new();
        let id = instance("j1", 0).instance_id;

        assert_eq!(store.signal(&id).await.unwrap(), InstanceSignal::None);
        store.set_signal(&id, InstanceSignal::Pause).await.unwrap();
        store.set_signal(&id, InstanceSignal::Terminate).await.unwrap();
        let merged = store.set_signal(&id, InstanceSignal::None).await.unwrap();
        assert_eq!(merged, InstanceSignal::Terminate);
    }
}

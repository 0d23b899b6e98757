//! Redis instance store: JSON records, a per-job index, an active set, a
//! signal key and a run lock per instance.

use std::time::Duration;

use async_trait::async_trait;
use redis::Script;
use tether_models::{InstanceId, InstanceRecord, InstanceSignal, JobId};
use tracing::debug;

use super::RedisBackend;
use crate::error::{StoreError, StoreResult};
use crate::instances::InstanceStore;

/// ARGV: requested signal
const SIGNAL_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == 'terminate' then
    return current
end
redis.call('SET', KEYS[1], ARGV[1])
return ARGV[1]
"#;

/// ARGV: owner, ttl_ms
const LOCK_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current and current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
"#;

/// ARGV: owner
const UNLOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisInstanceStore {
    backend: RedisBackend,
    signal: Script,
    lock: Script,
    unlock: Script,
}

impl RedisInstanceStore {
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            signal: Script::new(SIGNAL_SCRIPT),
            lock: Script::new(LOCK_SCRIPT),
            unlock: Script::new(UNLOCK_SCRIPT),
        }
    }

    fn record_key(&self, instance_id: &InstanceId) -> String {
        self.backend.key(&format!("instance:{{{}}}", instance_id))
    }

    fn signal_key(&self, instance_id: &InstanceId) -> String {
        format!("{}:signal", self.record_key(instance_id))
    }

    fn lock_key(&self, instance_id: &InstanceId) -> String {
        format!("{}:lock", self.record_key(instance_id))
    }

    fn job_index_key(&self, job_id: &JobId) -> String {
        self.backend.key(&format!("job:{{{}}}:instances", job_id))
    }

    fn active_key(&self) -> String {
        self.backend.key("instances:active")
    }

    async fn index(&self, record: &InstanceRecord) -> StoreResult<()> {
        let id = record.instance_id.to_string();
        let _: i64 = self
            .backend
            .query(
                "instance.index",
                redis::cmd("SADD").arg(self.job_index_key(&record.job_id)).arg(&id),
            )
            .await?;

        let active = if record.status.is_terminal() {
            redis::cmd("SREM").arg(self.active_key()).arg(&id).clone()
        } else {
            redis::cmd("SADD").arg(self.active_key()).arg(&id).clone()
        };
        let _: i64 = self.backend.query("instance.index", &active).await?;
        Ok(())
    }

    async fn load_all(&self, ids: Vec<String>) -> StoreResult<Vec<InstanceRecord>> {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&InstanceId::from_string(id)).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| (&a.job_id.0, a.shard).cmp(&(&b.job_id.0, b.shard)));
        Ok(records)
    }
}

#[async_trait]
impl InstanceStore for RedisInstanceStore {
    async fn create(&self, record: &InstanceRecord) -> StoreResult<bool> {
        let created: Option<String> = self
            .backend
            .query(
                "instance.create",
                redis::cmd("SET")
                    .arg(self.record_key(&record.instance_id))
                    .arg(serde_json::to_string(record)?)
                    .arg("NX"),
            )
            .await?;

        // Indexing is idempotent, so a retry after a partial create repairs it.
        if created.is_some() {
            self.index(record).await?;
            Ok(true)
        } else {
            if let Some(existing) = self.get(&record.instance_id).await? {
                self.index(&existing).await?;
            }
            debug!(instance_id = %record.instance_id, "Instance already exists");
            Ok(false)
        }
    }

    async fn get(&self, instance_id: &InstanceId) -> StoreResult<Option<InstanceRecord>> {
        let key = self.record_key(instance_id);
        let raw: Option<String> = self
            .backend
            .query("instance.get", redis::cmd("GET").arg(&key))
            .await?;
        raw.map(|json| serde_json::from_str(&json).map_err(|e| StoreError::corrupt(key.clone(), e.to_string())))
            .transpose()
    }

    async fn save(&self, record: &InstanceRecord) -> StoreResult<()> {
        let _: String = self
            .backend
            .query(
                "instance.save",
                redis::cmd("SET")
                    .arg(self.record_key(&record.instance_id))
                    .arg(serde_json::to_string(record)?),
            )
            .await?;
        self.index(record).await
    }

    async fn list_by_job(&self, job_id: &JobId) -> StoreResult<Vec<InstanceRecord>> {
        let ids: Vec<String> = self
            .backend
            .query("instance.list_by_job", redis::cmd("SMEMBERS").arg(self.job_index_key(job_id)))
            .await?;
        self.load_all(ids).await
    }

    async fn list_active(&self) -> StoreResult<Vec<InstanceRecord>> {
        let ids: Vec<String> = self
            .backend
            .query("instance.list_active", redis::cmd("SMEMBERS").arg(self.active_key()))
            .await?;
        let records = self.load_all(ids).await?;
        Ok(records.into_iter().filter(|r| !r.status.is_terminal()).collect())
    }

    async fn set_signal(&self, instance_id: &InstanceId, signal: InstanceSignal) -> StoreResult<InstanceSignal> {
        let merged: String = self
            .backend
            .script(
                "instance.set_signal",
                &self.signal,
                &[self.signal_key(instance_id)],
                &[signal.as_str().to_string()],
            )
            .await?;
        Ok(InstanceSignal::parse(&merged))
    }

    async fn signal(&self, instance_id: &InstanceId) -> StoreResult<InstanceSignal> {
        let raw: Option<String> = self
            .backend
            .query("instance.signal", redis::cmd("GET").arg(self.signal_key(instance_id)))
            .await?;
        Ok(raw.map(|s| InstanceSignal::parse(&s)).unwrap_or_default())
    }

    async fn try_lock(&self, instance_id: &InstanceId, owner: &str, ttl: Duration) -> StoreResult<bool> {
        let acquired: i64 = self
            .backend
            .script(
                "instance.try_lock",
                &self.lock,
                &[self.lock_key(instance_id)],
                &[owner.to_string(), (ttl.as_millis() as u64).max(1).to_string()],
            )
            .await?;
        Ok(acquired == 1)
    }

    async fn unlock(&self, instance_id: &InstanceId, owner: &str) -> StoreResult<()> {
        let _: i64 = self
            .backend
            .script(
                "instance.unlock",
                &self.unlock,
                &[self.lock_key(instance_id)],
                &[owner.to_string()],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_store::test_support::backend;
    use serde_json::json;
    use tether_models::InstanceStatus;

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_create_signal_and_lock() {
        let store = RedisInstanceStore::new(backend());
        let job_id = JobId::from_string("j1");
        let mut record = InstanceRecord::new(job_id.clone(), "render", 0, 1, json!({}), &["run".to_string()]);

        assert!(store.create(&record).await.unwrap());
        assert!(!store.create(&record).await.unwrap());
        assert_eq!(store.list_active().await.unwrap().len(), 1);

        assert!(store.try_lock(&record.instance_id, "w1", Duration::from_secs(5)).await.unwrap());
        assert!(!store.try_lock(&record.instance_id, "w2", Duration::from_secs(5)).await.unwrap());
        store.unlock(&record.instance_id, "w1").await.unwrap();
        assert!(store.try_lock(&record.instance_id, "w2", Duration::from_secs(5)).await.unwrap());

        store.set_signal(&record.instance_id, InstanceSignal::Terminate).await.unwrap();
        assert_eq!(
            store.set_signal(&record.instance_id, InstanceSignal::None).await.unwrap(),
            InstanceSignal::Terminate
        );

        record.status = InstanceStatus::Terminated;
        store.save(&record).await.unwrap();
        assert!(store.list_active().await.unwrap().is_empty());
        assert_eq!(store.list_by_job(&job_id).await.unwrap().len(), 1);
    }
}

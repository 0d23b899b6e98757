//! Control-plane audit log with bounded per-job retention.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tether_models::{AuditEntry, JobId};
use tokio::sync::Mutex;

use crate::error::StoreResult;

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()>;

    /// Entries for a job, oldest first.
    async fn list(&self, job_id: &JobId) -> StoreResult<Vec<AuditEntry>>;
}

pub struct InMemoryAuditLog {
    entries: Mutex<HashMap<JobId, VecDeque<AuditEntry>>>,
    max_len: usize,
}

impl Default for InMemoryAuditLog {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl InMemoryAuditLog {
    pub fn new(max_len: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_len: max_len.max(1),
        }
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()> {
        let mut entries = self.entries.lock().await;
        let log = entries.entry(entry.job_id.clone()).or_default();
        log.push_back(entry.clone());
        while log.len() > self.max_len {
            log.pop_front();
        }
        Ok(())
    }

    async fn list(&self, job_id: &JobId) -> StoreResult<Vec<AuditEntry>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(job_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default())
    }
}

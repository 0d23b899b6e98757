//! Redis audit log: a capped list per job.

use async_trait::async_trait;
use redis::Script;
use tether_models::{AuditEntry, JobId};

use super::RedisBackend;
use crate::audit::AuditLog;
use crate::error::StoreResult;

/// ARGV: entry json, max length
const APPEND_SCRIPT: &str = r#"
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('LTRIM', KEYS[1], -tonumber(ARGV[2]), -1)
return 1
"#;

pub struct RedisAuditLog {
    backend: RedisBackend,
    max_len: usize,
    append: Script,
}

impl RedisAuditLog {
    pub fn new(backend: RedisBackend, max_len: usize) -> Self {
        Self {
            backend,
            max_len: max_len.max(1),
            append: Script::new(APPEND_SCRIPT),
        }
    }

    fn job_key(&self, job_id: &JobId) -> String {
        self.backend.key(&format!("audit:{{{}}}", job_id))
    }
}

#[async_trait]
impl AuditLog for RedisAuditLog {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()> {
        let _: i64 = self
            .backend
            .script(
                "audit.append",
                &self.append,
                &[self.job_key(&entry.job_id)],
                &[serde_json::to_string(entry)?, self.max_len.to_string()],
            )
            .await?;
        Ok(())
    }

    async fn list(&self, job_id: &JobId) -> StoreResult<Vec<AuditEntry>> {
        let raw: Vec<String> = self
            .backend
            .query("audit.list", redis::cmd("LRANGE").arg(self.job_key(job_id)).arg(0).arg(-1))
            .await?;
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }
}

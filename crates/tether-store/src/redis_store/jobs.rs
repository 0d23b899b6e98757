//! Redis job records: one hash per job plus two per-job sets for applied
//! checkpoint tokens and finished instances. Every mutation is a script.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tether_models::{
    ErrorClass, ErrorSummary, InstanceId, JobId, JobRecord, JobStatus, ProgressDelta, TransitionOutcome,
};
use tracing::{debug, info};

use super::RedisBackend;
use crate::error::{StoreError, StoreResult};
use crate::jobs::JobRecordStore;

/// ARGV: flat field/value pairs
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV))
return 1
"#;

/// KEYS: job, checkpoints. ARGV: processed, succeeded, failed, token, now
const PROGRESS_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
if ARGV[4] ~= '' and redis.call('SADD', KEYS[2], ARGV[4]) == 0 then
    return 0
end
redis.call('HINCRBY', KEYS[1], 'processed_units', ARGV[1])
redis.call('HINCRBY', KEYS[1], 'succeeded_units', ARGV[2])
redis.call('HINCRBY', KEYS[1], 'failed_units', ARGV[3])
redis.call('HSET', KEYS[1], 'updated_at', ARGV[5])
return 1
"#;

/// ARGV: to, now, terminal flag, allowed source statuses...
const TRANSITION_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then
    return {'missing', ''}
end
if current == ARGV[1] then
    return {'unchanged', current}
end
for i = 4, #ARGV do
    if ARGV[i] == current then
        redis.call('HSET', KEYS[1], 'status', ARGV[1], 'updated_at', ARGV[2])
        if ARGV[1] == 'running' and redis.call('HEXISTS', KEYS[1], 'started_at') == 0 then
            redis.call('HSET', KEYS[1], 'started_at', ARGV[2])
        end
        if ARGV[3] == '1' then
            redis.call('HSET', KEYS[1], 'finished_at', ARGV[2])
        end
        return {'applied', current}
    end
end
return {'rejected', current}
"#;

/// ARGV: rank, class, message, now
const RECORD_ERROR_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
local existing = redis.call('HGET', KEYS[1], 'error_rank')
if existing and tonumber(existing) >= tonumber(ARGV[1]) then
    return 0
end
redis.call('HSET', KEYS[1], 'error_rank', ARGV[1], 'error_class', ARGV[2],
    'error_message', ARGV[3], 'error_at', ARGV[4], 'updated_at', ARGV[4])
return 1
"#;

/// ARGV: reason, now
const CANCEL_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
if redis.call('HGET', KEYS[1], 'cancel_requested') == '1' then
    return 0
end
redis.call('HSET', KEYS[1], 'cancel_requested', '1', 'updated_at', ARGV[2])
if ARGV[1] ~= '' then
    redis.call('HSET', KEYS[1], 'cancel_reason', ARGV[1])
end
return 1
"#;

/// ARGV: field, value, now
const SET_FIELD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2], 'updated_at', ARGV[3])
return 1
"#;

/// KEYS: job, finished. ARGV: instance, now
const FINISHED_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return -1
end
redis.call('SADD', KEYS[2], ARGV[1])
local count = redis.call('SCARD', KEYS[2])
redis.call('HSET', KEYS[1], 'finished_instances', count, 'updated_at', ARGV[2])
return count
"#;

pub struct RedisJobStore {
    backend: RedisBackend,
    create: Script,
    progress: Script,
    transition: Script,
    record_error: Script,
    cancel: Script,
    set_field: Script,
    finished: Script,
}

impl RedisJobStore {
    pub fn new(backend: RedisBackend) -> Self {
        Self {
            backend,
            create: Script::new(CREATE_SCRIPT),
            progress: Script::new(PROGRESS_SCRIPT),
            transition: Script::new(TRANSITION_SCRIPT),
            record_error: Script::new(RECORD_ERROR_SCRIPT),
            cancel: Script::new(CANCEL_SCRIPT),
            set_field: Script::new(SET_FIELD_SCRIPT),
            finished: Script::new(FINISHED_SCRIPT),
        }
    }

    fn job_key(&self, job_id: &JobId) -> String {
        self.backend.key(&format!("job:{{{}}}", job_id))
    }

    fn checkpoints_key(&self, job_id: &JobId) -> String {
        format!("{}:checkpoints", self.job_key(job_id))
    }

    fn finished_key(&self, job_id: &JobId) -> String {
        format!("{}:finished", self.job_key(job_id))
    }

    async fn set_field(&self, job_id: &JobId, field: &str, value: String) -> StoreResult<()> {
        let updated: i64 = self
            .backend
            .script(
                "job.set_field",
                &self.set_field,
                &[self.job_key(job_id)],
                &[field.to_string(), value, now()],
            )
            .await?;
        found(job_id, updated).map(|_| ())
    }

    async fn run_transition(
        &self,
        job_id: &JobId,
        to: JobStatus,
        sources: &[JobStatus],
    ) -> StoreResult<TransitionOutcome> {
        let mut args = vec![
            to.as_str().to_string(),
            now(),
            if to.is_terminal() { "1" } else { "0" }.to_string(),
        ];
        args.extend(sources.iter().map(|s| s.as_str().to_string()));

        let key = self.job_key(job_id);
        let reply: Vec<String> = self
            .backend
            .script("job.transition", &self.transition, &[key.clone()], &args)
            .await?;

        let current = reply
            .get(1)
            .and_then(|s| JobStatus::parse(s));
        match (reply.first().map(String::as_str), current) {
            (Some("missing"), _) => Err(StoreError::not_found(format!("job {}", job_id))),
            (Some("unchanged"), _) => Ok(TransitionOutcome::Unchanged),
            (Some("applied"), Some(from)) => Ok(TransitionOutcome::Applied { from }),
            (Some("rejected"), Some(current)) => Ok(TransitionOutcome::Rejected { current }),
            (other, _) => Err(StoreError::corrupt(key, format!("unexpected transition reply {:?}", other))),
        }
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn found(job_id: &JobId, reply: i64) -> StoreResult<i64> {
    if reply < 0 {
        Err(StoreError::not_found(format!("job {}", job_id)))
    } else {
        Ok(reply)
    }
}

fn record_to_fields(record: &JobRecord) -> StoreResult<Vec<String>> {
    let mut fields = vec![
        ("job_id", record.job_id.to_string()),
        ("job_type", record.job_type.clone()),
        ("status", record.status.as_str().to_string()),
        ("total_units", record.total_units.to_string()),
        ("processed_units", record.processed_units.to_string()),
        ("succeeded_units", record.succeeded_units.to_string()),
        ("failed_units", record.failed_units.to_string()),
        ("parameters", serde_json::to_string(&record.parameters)?),
        ("cancel_requested", if record.cancel_requested { "1" } else { "0" }.to_string()),
        ("instance_count", record.instance_count.to_string()),
        ("finished_instances", record.finished_instances.to_string()),
        ("created_at", record.created_at.to_rfc3339()),
        ("updated_at", record.updated_at.to_rfc3339()),
    ];
    if let Some(pointer) = &record.result_pointer {
        fields.push(("result_pointer", pointer.clone()));
    }
    if let Some(reason) = &record.cancel_reason {
        fields.push(("cancel_reason", reason.clone()));
    }
    if let Some(summary) = &record.error_summary {
        fields.push(("error_rank", summary.class.severity().to_string()));
        fields.push(("error_class", summary.class.as_str().to_string()));
        fields.push(("error_message", summary.message.clone()));
        fields.push(("error_at", summary.recorded_at.to_rfc3339()));
    }
    if let Some(at) = record.started_at {
        fields.push(("started_at", at.to_rfc3339()));
    }
    if let Some(at) = record.finished_at {
        fields.push(("finished_at", at.to_rfc3339()));
    }

    Ok(fields
        .into_iter()
        .flat_map(|(name, value)| [name.to_string(), value])
        .collect())
}

fn record_from_fields(key: &str, fields: &HashMap<String, String>) -> StoreResult<JobRecord> {
    let text = |name: &str| fields.get(name).cloned();
    let number = |name: &str| -> StoreResult<u64> {
        fields
            .get(name)
            .map(|v| v.parse::<u64>())
            .transpose()
            .map(Option::unwrap_or_default)
            .map_err(|e| StoreError::corrupt(key, format!("{}: {}", name, e)))
    };
    let time = |name: &str| -> StoreResult<Option<DateTime<Utc>>> {
        fields
            .get(name)
            .map(|v| DateTime::parse_from_rfc3339(v).map(|t| t.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| StoreError::corrupt(key, format!("{}: {}", name, e)))
    };

    let status = fields
        .get("status")
        .and_then(|s| JobStatus::parse(s))
        .ok_or_else(|| StoreError::corrupt(key, "missing or unknown status"))?;
    let error_summary = match (text("error_class"), time("error_at")?) {
        (Some(class), Some(recorded_at)) => Some(ErrorSummary {
            class: ErrorClass::parse(&class)
                .ok_or_else(|| StoreError::corrupt(key, format!("unknown error class {}", class)))?,
            message: text("error_message").unwrap_or_default(),
            recorded_at,
        }),
        _ => None,
    };
    let created_at = time("created_at")?.ok_or_else(|| StoreError::corrupt(key, "missing created_at"))?;

    Ok(JobRecord {
        job_id: JobId::from_string(text("job_id").unwrap_or_default()),
        job_type: text("job_type").unwrap_or_default(),
        status,
        total_units: number("total_units")?,
        processed_units: number("processed_units")?,
        succeeded_units: number("succeeded_units")?,
        failed_units: number("failed_units")?,
        parameters: fields
            .get("parameters")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default(),
        result_pointer: text("result_pointer"),
        error_summary,
        cancel_requested: fields.get("cancel_requested").map(String::as_str) == Some("1"),
        cancel_reason: text("cancel_reason"),
        instance_count: number("instance_count")? as u32,
        finished_instances: number("finished_instances")? as u32,
        created_at,
        updated_at: time("updated_at")?.unwrap_or(created_at),
        started_at: time("started_at")?,
        finished_at: time("finished_at")?,
    })
}

#[async_trait]
impl JobRecordStore for RedisJobStore {
    async fn create(&self, record: JobRecord) -> StoreResult<JobRecord> {
        let created: i64 = self
            .backend
            .script(
                "job.create",
                &self.create,
                &[self.job_key(&record.job_id)],
                &record_to_fields(&record)?,
            )
            .await?;

        if created == 1 {
            info!(job_id = %record.job_id, job_type = %record.job_type, "Created job record");
            return Ok(record);
        }
        debug!(job_id = %record.job_id, "Job record already exists");
        self.get(&record.job_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("job {}", record.job_id)))
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<JobRecord>> {
        let key = self.job_key(job_id);
        let fields: HashMap<String, String> = self
            .backend
            .query("job.get", redis::cmd("HGETALL").arg(&key))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(&key, &fields).map(Some)
    }

    async fn update_progress(&self, job_id: &JobId, delta: &ProgressDelta) -> StoreResult<bool> {
        let applied: i64 = self
            .backend
            .script(
                "job.update_progress",
                &self.progress,
                &[self.job_key(job_id), self.checkpoints_key(job_id)],
                &[
                    delta.processed.to_string(),
                    delta.succeeded.to_string(),
                    delta.failed.to_string(),
                    delta.checkpoint.clone().unwrap_or_default(),
                    now(),
                ],
            )
            .await?;
        Ok(found(job_id, applied)? == 1)
    }

    async fn set_cancel_requested(&self, job_id: &JobId, reason: Option<&str>) -> StoreResult<()> {
        let reply: i64 = self
            .backend
            .script(
                "job.cancel",
                &self.cancel,
                &[self.job_key(job_id)],
                &[reason.unwrap_or_default().to_string(), now()],
            )
            .await?;
        found(job_id, reply).map(|_| ())
    }

    async fn transition_status(&self, job_id: &JobId, to: JobStatus) -> StoreResult<TransitionOutcome> {
        self.run_transition(job_id, to, &JobStatus::allowed_sources(to)).await
    }

    async fn transition_status_from(
        &self,
        job_id: &JobId,
        from: JobStatus,
        to: JobStatus,
    ) -> StoreResult<TransitionOutcome> {
        let sources: Vec<JobStatus> = [from].into_iter().filter(|s| s.can_transition_to(to)).collect();
        self.run_transition(job_id, to, &sources).await
    }

    async fn set_total_units(&self, job_id: &JobId, total_units: u64) -> StoreResult<()> {
        self.set_field(job_id, "total_units", total_units.to_string()).await
    }

    async fn set_result_pointer(&self, job_id: &JobId, pointer: &str) -> StoreResult<()> {
        self.set_field(job_id, "result_pointer", pointer.to_string()).await
    }

    async fn record_error(&self, job_id: &JobId, class: ErrorClass, message: &str) -> StoreResult<bool> {
        let changed: i64 = self
            .backend
            .script(
                "job.record_error",
                &self.record_error,
                &[self.job_key(job_id)],
                &[
                    class.severity().to_string(),
                    class.as_str().to_string(),
                    message.to_string(),
                    now(),
                ],
            )
            .await?;
        Ok(found(job_id, changed)? == 1)
    }

    async fn mark_instance_finished(&self, job_id: &JobId, instance_id: &InstanceId) -> StoreResult<u32> {
        let count: i64 = self
            .backend
            .script(
                "job.mark_instance_finished",
                &self.finished,
                &[self.job_key(job_id), self.finished_key(job_id)],
                &[instance_id.to_string(), now()],
            )
            .await?;
        Ok(found(job_id, count)? as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redis_store::test_support::backend;

    #[test]
    fn test_fields_round_trip() {
        let mut record = JobRecord::new(JobId::from_string("j1"), "render").with_total_units(10);
        record.record_error(ErrorClass::BusinessTerminal, "bad input");
        record.request_cancel(Some("operator".to_string()));

        let flat = record_to_fields(&record).unwrap();
        let fields: HashMap<String, String> = flat
            .chunks(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        let parsed = record_from_fields("k", &fields).unwrap();

        assert_eq!(parsed.total_units, 10);
        assert!(parsed.cancel_requested);
        assert_eq!(parsed.cancel_reason.as_deref(), Some("operator"));
        assert_eq!(parsed.error_summary.unwrap().class, ErrorClass::BusinessTerminal);
    }

    #[test]
    fn test_unknown_status_is_corrupt() {
        let fields = HashMap::from([("status".to_string(), "exploded".to_string())]);
        assert!(matches!(
            record_from_fields("k", &fields),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_progress_transition_and_finish() {
        let store = RedisJobStore::new(backend());
        let job_id = store
            .create(JobRecord::new(JobId::from_string("j1"), "render").with_instance_count(2))
            .await
            .unwrap()
            .job_id;

        let delta = ProgressDelta::units(3, 1).at_checkpoint("shard-0/batch-0");
        assert!(store.update_progress(&job_id, &delta).await.unwrap());
        assert!(!store.update_progress(&job_id, &delta).await.unwrap());

        assert!(matches!(
            store.transition_status(&job_id, JobStatus::Running).await.unwrap(),
            TransitionOutcome::Applied { from: JobStatus::Pending }
        ));
        store.transition_status(&job_id, JobStatus::Paused).await.unwrap();
        assert!(store
            .transition_status_from(&job_id, JobStatus::Pending, JobStatus::Running)
            .await
            .unwrap()
            .is_rejected());
        store.transition_status(&job_id, JobStatus::Running).await.unwrap();
        store.transition_status(&job_id, JobStatus::Completed).await.unwrap();
        assert!(store
            .transition_status(&job_id, JobStatus::Running)
            .await
            .unwrap()
            .is_rejected());

        let shard0 = InstanceId::for_shard(&job_id, 0);
        assert_eq!(store.mark_instance_finished(&job_id, &shard0).await.unwrap(), 1);
        assert_eq!(store.mark_instance_finished(&job_id, &shard0).await.unwrap(), 1);

        let record = store.get(&job_id).await.unwrap().unwrap();
        assert_eq!(record.processed_units, 4);
        assert_eq!(record.status, JobStatus::Completed);
        assert!(record.finished_at.is_some());
    }
}

//! Redis idempotency ledger: one hash per key, expired by TTL.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use serde_json::Value;
use tether_models::{IdempotencyKey, LedgerContext, LedgerEntry, LedgerStatus, Reservation};

use super::RedisBackend;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::ledger::Ledger;
use crate::metrics;

/// ARGV: now_ms, owner, lease_ms, retention_secs, context_json
const RESERVE_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local status = redis.call('HGET', KEYS[1], 'status')
if not status then
    redis.call('HSET', KEYS[1],
        'status', 'pending', 'owner', ARGV[2], 'lease_until', now + tonumber(ARGV[3]),
        'attempts', 1, 'context', ARGV[5], 'created_at', now, 'updated_at', now,
        'expires_at', now + tonumber(ARGV[4]) * 1000)
    redis.call('EXPIRE', KEYS[1], ARGV[4])
    return {'reserved'}
end
if status == 'succeeded' then
    return {'succeeded', redis.call('HGET', KEYS[1], 'result') or 'null'}
end
if status == 'failed' then
    return {'failed', redis.call('HGET', KEYS[1], 'last_error') or ''}
end
local lease = tonumber(redis.call('HGET', KEYS[1], 'lease_until') or '0')
local owner = redis.call('HGET', KEYS[1], 'owner') or ''
if lease > now and owner ~= '' and owner ~= ARGV[2] then
    return {'in_progress', tostring(lease)}
end
if owner ~= ARGV[2] then
    redis.call('HINCRBY', KEYS[1], 'attempts', 1)
end
redis.call('HSET', KEYS[1], 'owner', ARGV[2], 'lease_until', now + tonumber(ARGV[3]), 'updated_at', now)
return {'reserved'}
"#;

/// ARGV: target_status, value_field, value, now_ms, retention_secs
const FINISH_SCRIPT: &str = r#"
local status = redis.call('HGET', KEYS[1], 'status')
if status == ARGV[1] then
    if redis.call('HGET', KEYS[1], ARGV[2]) == ARGV[3] then
        return 'ok'
    end
    return 'conflict:' .. status
end
if status and status ~= 'pending' then
    return 'conflict:' .. status
end
local now = tonumber(ARGV[4])
if not status then
    redis.call('HSET', KEYS[1], 'attempts', 1, 'context', '{}', 'created_at', now,
        'expires_at', now + tonumber(ARGV[5]) * 1000)
    redis.call('EXPIRE', KEYS[1], ARGV[5])
end
redis.call('HSET', KEYS[1], 'status', ARGV[1], ARGV[2], ARGV[3], 'updated_at', now, 'lease_until', 0, 'owner', '')
return 'ok'
"#;

/// ARGV: owner, now_ms
const RELEASE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'status') == 'pending' and redis.call('HGET', KEYS[1], 'owner') == ARGV[1] then
    redis.call('HSET', KEYS[1], 'owner', '', 'lease_until', 0, 'updated_at', ARGV[2])
    return 1
end
return 0
"#;

pub struct RedisLedger {
    backend: RedisBackend,
    lease: Duration,
    retention: Duration,
    reserve: Script,
    finish: Script,
    release: Script,
}

impl RedisLedger {
    pub fn new(backend: RedisBackend, config: &StoreConfig) -> Self {
        Self {
            backend,
            lease: config.ledger_lease,
            retention: config.ledger_retention,
            reserve: Script::new(RESERVE_SCRIPT),
            finish: Script::new(FINISH_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn entry_key(&self, key: &IdempotencyKey) -> String {
        self.backend.key(&format!("ledger:{}", key.as_str()))
    }

    fn retention_secs(&self) -> u64 {
        self.retention.as_secs().max(1)
    }

    async fn finish(&self, key: &IdempotencyKey, status: LedgerStatus, field: &str, value: String) -> StoreResult<()> {
        let outcome: String = self
            .backend
            .script(
                "ledger.finish",
                &self.finish,
                &[self.entry_key(key)],
                &[
                    status.as_str().to_string(),
                    field.to_string(),
                    value,
                    Utc::now().timestamp_millis().to_string(),
                    self.retention_secs().to_string(),
                ],
            )
            .await?;

        match outcome.strip_prefix("conflict:") {
            None => Ok(()),
            Some(existing) => Err(StoreError::conflict(
                key.as_str(),
                format!("already {}, refusing {}", existing, status),
            )),
        }
    }
}

fn millis(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|ms| *ms > 0)
        .and_then(DateTime::from_timestamp_millis)
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn check_and_reserve(
        &self,
        key: &IdempotencyKey,
        owner: &str,
        context: &LedgerContext,
    ) -> StoreResult<Reservation> {
        let reply: Vec<String> = self
            .backend
            .script(
                "ledger.reserve",
                &self.reserve,
                &[self.entry_key(key)],
                &[
                    Utc::now().timestamp_millis().to_string(),
                    owner.to_string(),
                    (self.lease.as_millis() as u64).to_string(),
                    self.retention_secs().to_string(),
                    serde_json::to_string(context)?,
                ],
            )
            .await?;

        let detail = reply.get(1).cloned().unwrap_or_default();
        let reservation = match reply.first().map(String::as_str) {
            Some("reserved") => Reservation::Reserved,
            Some("succeeded") => Reservation::AlreadySucceeded(serde_json::from_str(&detail)?),
            Some("failed") => Reservation::AlreadyFailed(detail),
            Some("in_progress") => Reservation::InProgress {
                lease_expires_at: detail
                    .parse::<i64>()
                    .ok()
                    .and_then(DateTime::from_timestamp_millis)
                    .unwrap_or_else(Utc::now),
            },
            other => {
                return Err(StoreError::corrupt(
                    key.as_str(),
                    format!("unexpected reserve reply {:?}", other),
                ))
            }
        };

        metrics::record_reservation(reservation.as_str());
        Ok(reservation)
    }

    async fn commit(&self, key: &IdempotencyKey, result: &Value) -> StoreResult<()> {
        self.finish(key, LedgerStatus::Succeeded, "result", serde_json::to_string(result)?)
            .await
    }

    async fn fail(&self, key: &IdempotencyKey, error: &str) -> StoreResult<()> {
        self.finish(key, LedgerStatus::Failed, "last_error", error.to_string())
            .await
    }

    async fn release(&self, key: &IdempotencyKey, owner: &str) -> StoreResult<()> {
        let _released: i64 = self
            .backend
            .script(
                "ledger.release",
                &self.release,
                &[self.entry_key(key)],
                &[owner.to_string(), Utc::now().timestamp_millis().to_string()],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, key: &IdempotencyKey) -> StoreResult<Option<LedgerEntry>> {
        let fields: HashMap<String, String> = self
            .backend
            .query("ledger.get", redis::cmd("HGETALL").arg(self.entry_key(key)))
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let status = fields
            .get("status")
            .and_then(|s| LedgerStatus::parse(s))
            .ok_or_else(|| StoreError::corrupt(key.as_str(), "missing status"))?;
        let now = Utc::now();

        Ok(Some(LedgerEntry {
            key: key.clone(),
            status,
            result: fields
                .get("result")
                .map(|raw| serde_json::from_str(raw))
                .transpose()?,
            last_error: fields.get("last_error").cloned(),
            owner: fields.get("owner").filter(|o| !o.is_empty()).cloned(),
            lease_expires_at: millis(&fields, "lease_until"),
            attempts: fields
                .get("attempts")
                .and_then(|a| a.parse().ok())
                .unwrap_or(0),
            context: fields
                .get("context")
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default(),
            created_at: millis(&fields, "created_at").unwrap_or(now),
            updated_at: millis(&fields, "updated_at").unwrap_or(now),
            expires_at: millis(&fields, "expires_at").unwrap_or(now),
        }))
    }
}

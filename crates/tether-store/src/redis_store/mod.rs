//! Redis-backed stores.
//!
//! Keys for one job share a `{job_id}` hash tag so the per-job scripts stay
//! single-slot on Redis Cluster.

mod audit;
mod instances;
mod jobs;
mod ledger;
mod sequence;

use std::time::Instant;

use redis::{FromRedisValue, Script};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::metrics::record_operation;
use crate::retry::{with_retry, RetryConfig};

pub use audit::RedisAuditLog;
pub use instances::RedisInstanceStore;
pub use jobs::RedisJobStore;
pub use ledger::RedisLedger;
pub use sequence::RedisSequenceStore;

/// Shared client, key prefix and retry policy for the Redis stores.
#[derive(Clone)]
pub struct RedisBackend {
    client: redis::Client,
    prefix: String,
    retry: RetryConfig,
}

impl RedisBackend {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> StoreResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            prefix: prefix.into(),
            retry: RetryConfig::from_env(),
        })
    }

    pub fn from_config(config: &StoreConfig) -> StoreResult<Self> {
        Self::new(&config.redis_url, config.key_prefix.clone())
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub(crate) fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    async fn conn(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::unavailable(e.to_string()))
    }

    pub async fn ping(&self) -> StoreResult<()> {
        self.query::<String>("ping", &redis::cmd("PING")).await?;
        Ok(())
    }

    /// Run a Lua script with retry and latency metrics.
    pub(crate) async fn script<T: FromRedisValue>(
        &self,
        operation: &str,
        script: &Script,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<T> {
        let started = Instant::now();
        let result = with_retry(&self.retry, operation, || async move {
            let mut conn = self.conn().await?;
            let mut invocation = script.prepare_invoke();
            for key in keys {
                invocation.key(key);
            }
            for arg in args {
                invocation.arg(arg);
            }
            Ok(invocation.invoke_async(&mut conn).await?)
        })
        .await;
        record_operation(operation, result.is_ok(), started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    /// Run a single command with retry and latency metrics.
    pub(crate) async fn query<T: FromRedisValue>(&self, operation: &str, cmd: &redis::Cmd) -> StoreResult<T> {
        let started = Instant::now();
        let result = with_retry(&self.retry, operation, || async move {
            let mut conn = self.conn().await?;
            Ok(cmd.query_async(&mut conn).await?)
        })
        .await;
        record_operation(operation, result.is_ok(), started.elapsed().as_secs_f64() * 1000.0);
        result
    }
}

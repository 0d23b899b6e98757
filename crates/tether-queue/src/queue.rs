//! Broker interface.

use std::time::Duration;

use async_trait::async_trait;
use tether_models::{DeadLetter, Envelope, ErrorClass};

use crate::error::QueueResult;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Stream name for messages
    pub stream_name: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Dead letter stream name
    pub dlq_stream_name: String,
    /// Approximate cap on dead-letter entries kept
    pub dlq_max_len: usize,
    /// Max envelopes per ingress batch
    pub max_batch_count: usize,
    /// Max serialized bytes per ingress batch
    pub max_batch_bytes: usize,
    /// Payloads above this size are moved to blob storage before send
    pub max_inline_payload_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            stream_name: "tether:messages".to_string(),
            consumer_group: "tether:workers".to_string(),
            dlq_stream_name: "tether:dlq".to_string(),
            dlq_max_len: 10_000,
            max_batch_count: 100,
            max_batch_bytes: 1024 * 1024,
            max_inline_payload_bytes: 64 * 1024,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            stream_name: std::env::var("QUEUE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            dlq_stream_name: std::env::var("QUEUE_DLQ_STREAM").unwrap_or(defaults.dlq_stream_name),
            dlq_max_len: env_parse("QUEUE_DLQ_MAX_LEN").unwrap_or(defaults.dlq_max_len),
            max_batch_count: env_parse("QUEUE_MAX_BATCH_COUNT").unwrap_or(defaults.max_batch_count),
            max_batch_bytes: env_parse("QUEUE_MAX_BATCH_BYTES").unwrap_or(defaults.max_batch_bytes),
            max_inline_payload_bytes: env_parse("QUEUE_MAX_INLINE_PAYLOAD_BYTES")
                .unwrap_or(defaults.max_inline_payload_bytes),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.parse().ok())
}

/// One delivery of a message to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker handle used to ack/retry/defer this delivery
    pub receipt: String,
    pub envelope: Envelope,
    /// 1-based attempt number used for retry accounting
    pub attempt: u32,
}

/// At-least-once broker with per-message acknowledgement.
///
/// Every operation acts on a single message so that one failure never
/// forces redelivery of its batch siblings.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn publish(&self, envelope: &Envelope) -> QueueResult<String>;

    async fn publish_batch(&self, envelopes: &[Envelope]) -> QueueResult<Vec<String>>;

    /// Lease up to `max` visible messages to `consumer`.
    async fn receive(&self, consumer: &str, max: usize) -> QueueResult<Vec<Delivery>>;

    /// Remove a delivered message for good.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Redeliver after `delay`, counting this attempt against the retry budget.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;

    /// Redeliver after `delay` without counting an attempt.
    async fn defer(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()>;

    /// Move a delivery to the dead-letter path and remove it from the queue.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        error: &str,
        class: ErrorClass,
    ) -> QueueResult<DeadLetter>;

    /// Take over deliveries leased longer than `min_idle` ago (crashed consumers).
    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Oldest-first listing of the dead-letter path.
    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>>;

    /// Operator action: put a dead letter back on the queue with a fresh
    /// retry budget. Returns the new message id.
    async fn redrive(&self, dead_letter_id: &str) -> QueueResult<String>;

    /// Operator action: drop a dead letter. Returns false if it did not exist.
    async fn purge_dead_letter(&self, dead_letter_id: &str) -> QueueResult<bool>;

    /// Messages waiting or in flight.
    async fn depth(&self) -> QueueResult<u64>;
}

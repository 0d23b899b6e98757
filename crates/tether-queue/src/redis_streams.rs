//! Message queue using Redis Streams.
//!
//! Layout:
//! - `stream_name`: live messages, fields `envelope` (JSON) and `failures`
//! - `stream_name:delayed`: sorted set of messages waiting out a retry or
//!   defer delay, scored by visible-at epoch millis
//! - `dlq_stream_name`: dead letters, capped with `MAXLEN ~`

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply, StreamReadReply};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tether_models::{DeadLetter, Envelope, ErrorClass};
use tracing::{debug, info, warn};

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::queue::{Delivery, MessageQueue, QueueConfig};

/// Moves due entries from the delayed set back onto the stream.
const PROMOTE_DELAYED_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[1], member)
    local msg = cjson.decode(member)
    redis.call('XADD', KEYS[2], '*', 'envelope', msg['envelope'], 'failures', msg['failures'])
end
return #due
"#;

const PROMOTE_BATCH: usize = 100;

/// Member of the delayed set. The envelope stays a JSON string so Lua never
/// re-encodes it.
#[derive(Debug, Serialize, Deserialize)]
struct DelayedMessage {
    envelope: String,
    failures: String,
    receipt: String,
}

/// Redis Streams queue client.
pub struct RedisStreamQueue {
    client: redis::Client,
    config: QueueConfig,
    delayed_key: String,
}

impl RedisStreamQueue {
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let delayed_key = format!("{}:delayed", config.stream_name);
        Ok(Self {
            client,
            config,
            delayed_key,
        })
    }

    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    /// Initialize the queue (create consumer group if not exists).
    pub async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.config.consumer_group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.config.consumer_group);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn xadd(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        envelope_json: &str,
        failures: u32,
    ) -> QueueResult<String> {
        let id: String = redis::cmd("XADD")
            .arg(&self.config.stream_name)
            .arg("*")
            .arg("envelope")
            .arg(envelope_json)
            .arg("failures")
            .arg(failures)
            .query_async(conn)
            .await?;
        Ok(id)
    }

    async fn promote_delayed(&self, conn: &mut redis::aio::MultiplexedConnection) -> QueueResult<()> {
        let moved: usize = redis::Script::new(PROMOTE_DELAYED_SCRIPT)
            .key(&self.delayed_key)
            .key(&self.config.stream_name)
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(conn)
            .await?;
        if moved > 0 {
            debug!(count = moved, "Promoted delayed messages");
        }
        Ok(())
    }

    /// Turn a stream entry into a delivery. Entries that cannot be decoded are
    /// parked in the dead-letter stream in raw form and acknowledged.
    async fn to_delivery(&self, entry: &StreamId, extra_attempts: u32) -> QueueResult<Option<Delivery>> {
        let raw: Option<String> = entry.get("envelope");
        let failures: u32 = entry.get("failures").unwrap_or(0);

        let reason = match raw.as_deref().map(serde_json::from_str::<Envelope>) {
            Some(Ok(envelope)) => {
                return Ok(Some(Delivery {
                    receipt: entry.id.clone(),
                    envelope,
                    attempt: failures + 1 + extra_attempts,
                }))
            }
            Some(Err(e)) => format!("undecodable envelope: {}", e),
            None => "missing envelope field".to_string(),
        };

        warn!(receipt = %entry.id, "Parking malformed stream entry: {}", reason);
        let mut conn = self.conn().await?;
        redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.dlq_max_len)
            .arg("*")
            .arg("raw")
            .arg(raw.unwrap_or_default())
            .arg("error")
            .arg(&reason)
            .query_async::<()>(&mut conn)
            .await?;
        self.ack_receipt(&entry.id).await?;
        Ok(None)
    }

    async fn ack_receipt(&self, receipt: &str) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        redis::cmd("XACK")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(receipt)
            .query_async::<()>(&mut conn)
            .await?;

        redis::cmd("XDEL")
            .arg(&self.config.stream_name)
            .arg(receipt)
            .query_async::<()>(&mut conn)
            .await?;

        debug!("Acknowledged message: {}", receipt);
        Ok(())
    }

    /// Re-add the message (immediately or via the delayed set), then ack the
    /// original entry. A crash in between leaves a duplicate, never a loss.
    async fn requeue(&self, delivery: &Delivery, failures: u32, delay: Duration) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let envelope_json = serde_json::to_string(&delivery.envelope)?;

        if delay.is_zero() {
            self.xadd(&mut conn, &envelope_json, failures).await?;
        } else {
            let member = serde_json::to_string(&DelayedMessage {
                envelope: envelope_json,
                failures: failures.to_string(),
                receipt: delivery.receipt.clone(),
            })?;
            let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
            conn.zadd::<_, _, _, ()>(&self.delayed_key, member, visible_at)
                .await?;
        }

        self.ack_receipt(&delivery.receipt).await
    }

    fn parse_dead_letter(entry: &StreamId) -> Option<DeadLetter> {
        let raw: String = entry.get("dead_letter")?;
        match serde_json::from_str::<DeadLetter>(&raw) {
            Ok(mut dead) => {
                dead.id = entry.id.clone();
                Some(dead)
            }
            Err(e) => {
                warn!(dead_letter_id = %entry.id, "Skipping undecodable dead letter: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl MessageQueue for RedisStreamQueue {
    async fn publish(&self, envelope: &Envelope) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(envelope)?;
        let id = self.xadd(&mut conn, &payload, 0).await?;

        info!(
            message_id = %envelope.message_id,
            idempotency_key = %envelope.idempotency_key,
            "Published {} as stream entry {}",
            envelope.message_type,
            id
        );
        metrics::record_published(&envelope.message_type, 1);
        Ok(id)
    }

    async fn publish_batch(&self, envelopes: &[Envelope]) -> QueueResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for envelope in envelopes {
            pipe.cmd("XADD")
                .arg(&self.config.stream_name)
                .arg("*")
                .arg("envelope")
                .arg(serde_json::to_string(envelope)?)
                .arg("failures")
                .arg(0);
        }
        let ids: Vec<String> = pipe.query_async(&mut conn).await?;

        for envelope in envelopes {
            metrics::record_published(&envelope.message_type, 1);
        }
        Ok(ids)
    }

    async fn receive(&self, consumer: &str, max: usize) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        self.promote_delayed(&mut conn).await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max)
            .arg("STREAMS")
            .arg(&self.config.stream_name)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        let mut deliveries = Vec::new();
        for stream_key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in &stream_key.ids {
                if let Some(delivery) = self.to_delivery(entry, 0).await? {
                    deliveries.push(delivery);
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        self.ack_receipt(&delivery.receipt).await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        self.requeue(delivery, delivery.attempt, delay).await
    }

    async fn defer(&self, delivery: &Delivery, delay: Duration) -> QueueResult<()> {
        self.requeue(delivery, delivery.attempt.saturating_sub(1), delay)
            .await
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        error: &str,
        class: ErrorClass,
    ) -> QueueResult<DeadLetter> {
        let mut conn = self.conn().await?;
        let mut entry = DeadLetter {
            id: String::new(),
            envelope: delivery.envelope.clone(),
            attempt_count: delivery.attempt,
            last_error: error.to_string(),
            error_class: class,
            dead_lettered_at: Utc::now(),
        };

        entry.id = redis::cmd("XADD")
            .arg(&self.config.dlq_stream_name)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.dlq_max_len)
            .arg("*")
            .arg("dead_letter")
            .arg(serde_json::to_string(&entry)?)
            .arg("original_id")
            .arg(&delivery.receipt)
            .query_async(&mut conn)
            .await?;

        self.ack_receipt(&delivery.receipt).await?;

        metrics::record_dead_lettered(&delivery.envelope.message_type, class.as_str());
        warn!(
            message_id = %delivery.envelope.message_id,
            attempt = delivery.attempt,
            error_class = %class,
            "Moved message {} to DLQ: {}",
            delivery.receipt,
            error
        );
        Ok(entry)
    }

    async fn claim_stale(
        &self,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut conn = self.conn().await?;
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(&self.config.stream_name)
            .arg(&self.config.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for p in &pending.ids {
            cmd.arg(&p.id);
        }
        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        let mut deliveries = Vec::new();
        for entry in &claimed.ids {
            // Every earlier delivery of this entry was abandoned mid-flight.
            let abandoned = pending
                .ids
                .iter()
                .find(|p| p.id == entry.id)
                .map(|p| p.times_delivered as u32)
                .unwrap_or(1);
            if let Some(delivery) = self.to_delivery(entry, abandoned).await? {
                info!(receipt = %delivery.receipt, attempt = delivery.attempt, "Claimed stale message");
                deliveries.push(delivery);
            }
        }
        Ok(deliveries)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn
            .xrange_count(&self.config.dlq_stream_name, "-", "+", limit)
            .await?;
        Ok(reply.ids.iter().filter_map(Self::parse_dead_letter).collect())
    }

    async fn redrive(&self, dead_letter_id: &str) -> QueueResult<String> {
        let mut conn = self.conn().await?;
        let reply: StreamRangeReply = conn
            .xrange(&self.config.dlq_stream_name, dead_letter_id, dead_letter_id)
            .await?;
        let dead = reply
            .ids
            .first()
            .and_then(Self::parse_dead_letter)
            .ok_or_else(|| QueueError::DeadLetterNotFound(dead_letter_id.to_string()))?;

        let payload = serde_json::to_string(&dead.envelope)?;
        let id = self.xadd(&mut conn, &payload, 0).await?;
        conn.xdel::<_, _, ()>(&self.config.dlq_stream_name, &[dead_letter_id])
            .await?;

        metrics::record_redriven();
        info!(dead_letter_id, new_id = %id, "Redrove dead letter");
        Ok(id)
    }

    async fn purge_dead_letter(&self, dead_letter_id: &str) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn
            .xdel(&self.config.dlq_stream_name, &[dead_letter_id])
            .await?;
        Ok(removed > 0)
    }

    async fn depth(&self) -> QueueResult<u64> {
        let mut conn = self.conn().await?;
        let live: u64 = conn.xlen(&self.config.stream_name).await?;
        let delayed: u64 = conn.zcard(&self.delayed_key).await?;
        Ok(live + delayed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_models::{MessageBody, ProcessUnit};

    fn test_config() -> QueueConfig {
        let suffix = uuid::Uuid::new_v4();
        QueueConfig {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            stream_name: format!("tether:test:{}", suffix),
            consumer_group: "tether:test-workers".to_string(),
            dlq_stream_name: format!("tether:test:{}:dlq", suffix),
            ..QueueConfig::default()
        }
    }

    fn envelope() -> Envelope {
        let body = MessageBody::ProcessUnit(ProcessUnit {
            job_id: None,
            stream: "s".to_string(),
            unit_id: "u-1".to_string(),
            sequence: None,
            data: json!({"n": 1}),
        });
        Envelope::new(&body, "u-1").unwrap()
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_publish_receive_retry_dead_letter() {
        let queue = RedisStreamQueue::new(test_config()).unwrap();
        queue.init().await.unwrap();
        queue.publish(&envelope()).await.unwrap();

        let first = queue.receive("c1", 10).await.unwrap().remove(0);
        assert_eq!(first.attempt, 1);
        queue.retry(&first, Duration::ZERO).await.unwrap();

        let second = queue.receive("c1", 10).await.unwrap().remove(0);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.envelope, first.envelope);

        let dead = queue
            .dead_letter(&second, "boom", ErrorClass::Transient)
            .await
            .unwrap();
        let listed = queue.dead_letters(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, dead.id);
        assert_eq!(listed[0].attempt_count, 2);
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_delayed_retry_is_promoted() {
        let queue = RedisStreamQueue::new(test_config()).unwrap();
        queue.init().await.unwrap();
        queue.publish(&envelope()).await.unwrap();

        let delivery = queue.receive("c1", 1).await.unwrap().remove(0);
        queue
            .defer(&delivery, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(queue.receive("c1", 1).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let again = queue.receive("c1", 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempt, 1);
    }
}

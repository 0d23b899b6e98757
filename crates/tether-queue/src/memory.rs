//! In-memory queue with the same delivery semantics as the Redis backend.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tether_models::{DeadLetter, Envelope, ErrorClass};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::queue::{Delivery, MessageQueue};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    envelope: Envelope,
    /// Attempts already consumed
    failures: u32,
    visible_at: Instant,
}

#[derive(Debug)]
struct Leased {
    message: StoredMessage,
    consumer: String,
    leased_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<String, Leased>,
    dead: VecDeque<DeadLetter>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Process-local queue for tests and single-node runs.
pub struct InMemoryQueue {
    state: Mutex<State>,
    dlq_max_len: usize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl InMemoryQueue {
    pub fn new(dlq_max_len: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            dlq_max_len: dlq_max_len.max(1),
        }
    }

    /// Number of messages currently leased to consumers.
    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    async fn requeue(&self, delivery: &Delivery, failures: u32, delay: Duration) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let Some(leased) = state.in_flight.remove(&delivery.receipt) else {
            warn!(receipt = %delivery.receipt, "Requeue for unknown delivery ignored");
            return Ok(());
        };

        let mut message = leased.message;
        message.failures = failures;
        message.visible_at = Instant::now() + delay;
        state.ready.push_back(message);
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, envelope: &Envelope) -> QueueResult<String> {
        let mut state = self.state.lock().await;
        let id = state.next_id("msg");
        state.ready.push_back(StoredMessage {
            id: id.clone(),
            envelope: envelope.clone(),
            failures: 0,
            visible_at: Instant::now(),
        });
        metrics::record_published(&envelope.message_type, 1);
        Ok(id)
    }

    async fn publish_batch(&self, envelopes: &[Envelope]) -> QueueResult<Vec<String>> {
        let mut ids = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            ids.push(self.publish(envelope).await?);
        }
        Ok(ids)
    }

    async fn receive(&self, consumer: &str, max: usize) -> QueueResult<Vec<Delivery>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut deliveries = Vec::new();
        let mut waiting = VecDeque::with_capacity(state.ready.len());

        while let Some(message) = state.ready.pop_front() {
            if deliveries.len() < max && message.visible_at <= now {
                deliveries.push(Delivery {
                    receipt: message.id.clone(),
                    envelope: message.envelope.clone(),
                    attempt: message.failures + 1,
                });
                state.in_flight.insert(
                    message.id.clone(),
                    Leased {
                        message,
                        consumer: consumer.to_string(),
                        leased_at: now,
                    },
                );
            } else {
                waiting.push_back(message);
            }
        }
        state.ready = waiting;

        if !deliveries.is_empty() {
            debug!(consumer, count = deliveries.len(), "Leased messages");
        }
        Ok(deliveries)
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&delivery.receipt).is_none() {
            debug!(receipt = %delivery.receipt, "Ack for unknown delivery ignored");
        }
        Ok(())
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
        let mut state = self.state.lock().await;
        state.in_flight.remove(&delivery.receipt);

        let entry = DeadLetter {
            id: state.next_id("dlq"),
            envelope: delivery.envelope.clone(),
            attempt_count: delivery.attempt,
            last_error: error.to_string(),
            error_class: class,
            dead_lettered_at: Utc::now(),
        };
        state.dead.push_back(entry.clone());

        while state.dead.len() > self.dlq_max_len {
            if let Some(evicted) = state.dead.pop_front() {
                warn!(dead_letter_id = %evicted.id, "Dead-letter retention exceeded, dropping oldest entry");
            }
        }

        metrics::record_dead_lettered(&delivery.envelope.message_type, class.as_str());
        warn!(
            message_id = %delivery.envelope.message_id,
            attempt = delivery.attempt,
            error_class = %class,
            "Moved message to dead-letter path: {}",
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
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut claimed = Vec::new();

        for leased in state.in_flight.values_mut() {
            if claimed.len() >= max {
                break;
            }
            if now.duration_since(leased.leased_at) < min_idle {
                continue;
            }
            // The previous consumer never finished: that attempt is spent.
            leased.message.failures += 1;
            leased.consumer = consumer.to_string();
            leased.leased_at = now;
            claimed.push(Delivery {
                receipt: leased.message.id.clone(),
                envelope: leased.message.envelope.clone(),
                attempt: leased.message.failures + 1,
            });
        }

        Ok(claimed)
    }

    async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        let state = self.state.lock().await;
        Ok(state.dead.iter().take(limit).cloned().collect())
    }

    async fn redrive(&self, dead_letter_id: &str) -> QueueResult<String> {
        let mut state = self.state.lock().await;
        let position = state
            .dead
            .iter()
            .position(|d| d.id == dead_letter_id)
            .ok_or_else(|| QueueError::DeadLetterNotFound(dead_letter_id.to_string()))?;
        let Some(entry) = state.dead.remove(position) else {
            return Err(QueueError::DeadLetterNotFound(dead_letter_id.to_string()));
        };

        let id = state.next_id("msg");
        state.ready.push_back(StoredMessage {
            id: id.clone(),
            envelope: entry.envelope,
            failures: 0,
            visible_at: Instant::now(),
        });
        metrics::record_redriven();
        Ok(id)
    }

    async fn purge_dead_letter(&self, dead_letter_id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.dead.len();
        state.dead.retain(|d| d.id != dead_letter_id);
        Ok(state.dead.len() != before)
    }

    async fn depth(&self) -> QueueResult<u64> {
        let state = self.state.lock().await;
        Ok((state.ready.len() + state.in_flight.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_models::{MessageBody, ProcessUnit};

    fn envelope(unit: &str) -> Envelope {
        let body = MessageBody::ProcessUnit(ProcessUnit {
            job_id: None,
            stream: "s".to_string(),
            unit_id: unit.to_string(),
            sequence: None,
            data: json!({}),
        });
        Envelope::new(&body, unit).unwrap()
    }

    #[tokio::test]
    async fn test_retry_counts_attempts_defer_does_not() {
        let queue = InMemoryQueue::default();
        queue.publish(&envelope("a")).await.unwrap();

        let first = queue.receive("c1", 10).await.unwrap().remove(0);
        assert_eq!(first.attempt, 1);
        queue.retry(&first, Duration::ZERO).await.unwrap();

        let second = queue.receive("c1", 10).await.unwrap().remove(0);
        assert_eq!(second.attempt, 2);
        queue.defer(&second, Duration::ZERO).await.unwrap();

        let third = queue.receive("c1", 10).await.unwrap().remove(0);
        assert_eq!(third.attempt, 2);
    }

    #[tokio::test]
    async fn test_delayed_message_is_invisible() {
        let queue = InMemoryQueue::default();
        queue.publish(&envelope("a")).await.unwrap();
        let delivery = queue.receive("c1", 1).await.unwrap().remove(0);
        queue.retry(&delivery, Duration::from_secs(60)).await.unwrap();

        assert!(queue.receive("c1", 10).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ack_removes_only_that_message() {
        let queue = InMemoryQueue::default();
        queue
            .publish_batch(&[envelope("a"), envelope("b")])
            .await
            .unwrap();

        let deliveries = queue.receive("c1", 10).await.unwrap();
        queue.ack(&deliveries[0]).await.unwrap();
        assert_eq!(queue.in_flight().await, 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_claim_stale_takes_over_lease() {
        let queue = InMemoryQueue::default();
        queue.publish(&envelope("a")).await.unwrap();
        let original = queue.receive("crashed", 1).await.unwrap().remove(0);

        let claimed = queue
            .claim_stale("rescuer", Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].receipt, original.receipt);
        assert_eq!(claimed[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_redrive_and_purge() {
        let queue = InMemoryQueue::default();
        queue.publish(&envelope("a")).await.unwrap();
        queue.publish(&envelope("b")).await.unwrap();
        let deliveries = queue.receive("c1", 10).await.unwrap();

        let first = queue
            .dead_letter(&deliveries[0], "boom", ErrorClass::Transient)
            .await
            .unwrap();
        let second = queue
            .dead_letter(&deliveries[1], "bad", ErrorClass::Validation)
            .await
            .unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.dead_letters(10).await.unwrap().len(), 2);

        queue.redrive(&first.id).await.unwrap();
        let redriven = queue.receive("c1", 10).await.unwrap();
        assert_eq!(redriven.len(), 1);
        assert_eq!(redriven[0].attempt, 1);

        assert!(queue.purge_dead_letter(&second.id).await.unwrap());
        assert!(!queue.purge_dead_letter(&second.id).await.unwrap());
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dead_letter_retention_is_bounded() {
        let queue = InMemoryQueue::new(2);
        for unit in ["a", "b", "c"] {
            queue.publish(&envelope(unit)).await.unwrap();
        }
        for delivery in queue.receive("c1", 10).await.unwrap() {
            queue
                .dead_letter(&delivery, "boom", ErrorClass::Transient)
                .await
                .unwrap();
        }

        let remaining = queue.dead_letters(10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].envelope.subject, "b");
    }
}

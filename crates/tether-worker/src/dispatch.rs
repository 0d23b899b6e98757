//! Dispatch loop.
//!
//! Each delivery goes through reserve -> handle -> commit/fail -> ack on its
//! own. A delivery is acknowledged only after its outcome is durable in the
//! ledger (or the ledger already held one), and a failure affects only that
//! delivery: nothing else in the batch is redelivered.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tether_models::{ErrorClass, JobStatus, LedgerContext, Reservation};
use tether_queue::{resolve_payload, Delivery, MessageQueue};
use tether_storage::BlobStore;
use tether_store::{JobRecordStore, Ledger};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::handler::{Handler, HandlerError, Message};
use crate::metrics;
use crate::retry::RetryPolicy;

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Retried,
    Deferred,
    DeadLettered,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Acked => "acked",
            Outcome::Retried => "retried",
            Outcome::Deferred => "deferred",
            Outcome::DeadLettered => "dead_lettered",
        }
    }
}

/// Per-batch outcome counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub acked: usize,
    pub retried: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
    /// Deliveries whose queue operation failed; the broker will redeliver them
    pub errors: usize,
}

impl BatchReport {
    pub fn record(&mut self, outcome: &WorkerResult<Outcome>) {
        match outcome {
            Ok(Outcome::Acked) => self.acked += 1,
            Ok(Outcome::Retried) => self.retried += 1,
            Ok(Outcome::Deferred) => self.deferred += 1,
            Ok(Outcome::DeadLettered) => self.dead_lettered += 1,
            Err(_) => self.errors += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.acked + self.retried + self.deferred + self.dead_lettered + self.errors
    }
}

pub struct Consumer {
    config: WorkerConfig,
    queue: Arc<dyn MessageQueue>,
    ledger: Arc<dyn Ledger>,
    jobs: Arc<dyn JobRecordStore>,
    blobs: Arc<dyn BlobStore>,
    handler: Arc<dyn Handler>,
    retry_policy: RetryPolicy,
    semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Consumer {
    pub fn new(
        config: WorkerConfig,
        queue: Arc<dyn MessageQueue>,
        ledger: Arc<dyn Ledger>,
        jobs: Arc<dyn JobRecordStore>,
        blobs: Arc<dyn BlobStore>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_messages.max(1)));
        let (shutdown, _) = watch::channel(false);
        let retry_policy = RetryPolicy::new(config.retry_base_delay, config.retry_max_delay);

        Self {
            config,
            queue,
            ledger,
            jobs,
            blobs,
            handler,
            retry_policy,
            semaphore,
            shutdown,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Ask the run loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    // =========================================================================
    // Run loop
    // =========================================================================

    /// Consume until shutdown, then drain in-flight deliveries.
    pub async fn run(self: Arc<Self>) -> WorkerResult<()> {
        info!(
            consumer = %self.config.consumer_name,
            max_concurrent = self.config.max_concurrent_messages,
            "Starting consumer"
        );

        let mut shutdown_rx = self.shutdown.subscribe();
        let claim_task = {
            let this = Arc::clone(&self);
            tokio::spawn(async move { this.claim_loop().await })
        };

        while !*shutdown_rx.borrow() {
            tokio::select! {
                _ = shutdown_rx.changed() => {}
                result = self.consume() => {
                    if let Err(e) = result {
                        error!("Error consuming messages: {}", e);
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            }
        }
        info!("Shutdown signal received, stopping consumer");
        claim_task.abort();

        let permits = self.config.max_concurrent_messages.max(1) as u32;
        if tokio::time::timeout(self.config.shutdown_timeout, self.semaphore.acquire_many(permits))
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with deliveries in flight; they will be redelivered");
        }

        info!("Consumer stopped");
        Ok(())
    }

    async fn consume(self: &Arc<Self>) -> WorkerResult<()> {
        let available = self.semaphore.available_permits();
        if available == 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let deliveries = self
            .queue
            .receive(&self.config.consumer_name, available.min(self.config.batch_size))
            .await?;
        if deliveries.is_empty() {
            tokio::time::sleep(self.config.poll_interval).await;
            return Ok(());
        }

        debug!(count = deliveries.len(), "Received deliveries");
        self.spawn_all(deliveries).await
    }

    async fn claim_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.claim_interval);
        loop {
            interval.tick().await;
            match self
                .queue
                .claim_stale(
                    &self.config.consumer_name,
                    self.config.visibility_timeout,
                    self.config.batch_size,
                )
                .await
            {
                Ok(claimed) if !claimed.is_empty() => {
                    info!(count = claimed.len(), "Claimed stale deliveries");
                    if let Err(e) = self.spawn_all(claimed).await {
                        warn!("Failed to dispatch claimed deliveries: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to claim stale deliveries: {}", e),
            }
        }
    }

    async fn spawn_all(self: &Arc<Self>, deliveries: Vec<Delivery>) -> WorkerResult<()> {
        for delivery in deliveries {
            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::config_error("consumer semaphore closed"))?;
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                let _ = this.process(delivery).await;
            });
        }
        Ok(())
    }

    // =========================================================================
    // Per-delivery processing
    // =========================================================================

    /// Process one received batch; deliveries run concurrently and
    /// independently.
    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> BatchReport {
        let results = join_all(deliveries.into_iter().map(|d| self.process(d))).await;
        let mut report = BatchReport::default();
        for result in &results {
            report.record(result);
        }
        report
    }

    /// Receive and process a single batch.
    pub async fn poll_once(&self) -> WorkerResult<BatchReport> {
        let deliveries = self
            .queue
            .receive(&self.config.consumer_name, self.config.batch_size)
            .await?;
        Ok(self.process_batch(deliveries).await)
    }

    pub async fn process(&self, delivery: Delivery) -> WorkerResult<Outcome> {
        let span = info_span!(
            "message",
            message_id = %delivery.envelope.message_id,
            message_type = %delivery.envelope.message_type,
            idempotency_key = %delivery.envelope.idempotency_key,
            attempt = delivery.attempt
        );
        let message_type = delivery.envelope.message_type.clone();
        metrics::record_received(&message_type);

        let result = self.dispatch(&delivery).instrument(span).await;
        match &result {
            Ok(outcome) => metrics::record_outcome(&message_type, outcome.as_str()),
            Err(e) => error!(
                message_id = %delivery.envelope.message_id,
                "Queue operation failed, leaving delivery for redelivery: {}", e
            ),
        }
        result
    }

    async fn dispatch(&self, delivery: &Delivery) -> WorkerResult<Outcome> {
        let envelope = match resolve_payload(self.blobs.as_ref(), delivery.envelope.clone()).await {
            Ok(envelope) => envelope,
            Err(e) if e.is_retryable() => return self.retry_or_exhaust(delivery, &e.to_string()).await,
            Err(e) => {
                return self
                    .dead_letter(delivery, &e.to_string(), ErrorClass::Validation)
                    .await
            }
        };

        let body = match envelope.validate().and_then(|_| envelope.body()) {
            Ok(body) => body,
            Err(e) => {
                return self
                    .dead_letter(delivery, &e.to_string(), ErrorClass::Validation)
                    .await
            }
        };
        let message = Message {
            envelope,
            body,
            attempt: delivery.attempt,
        };
        let key = &message.envelope.idempotency_key;
        let owner = self.lease_owner(delivery);
        let context = LedgerContext {
            correlation_id: Some(message.envelope.correlation_id.clone()),
            message_id: Some(message.envelope.message_id.to_string()),
            job_id: message.job_id().map(|id| id.to_string()),
            instance_id: None,
        };

        match self
            .ledger
            .check_and_reserve(key, &owner, &context)
            .await
        {
            Ok(Reservation::Reserved) => {}
            Ok(Reservation::AlreadySucceeded(_)) => {
                debug!("Already processed, acknowledging without re-running");
                metrics::record_ledger_hit("succeeded");
                return self.ack(delivery).await;
            }
            Ok(Reservation::AlreadyFailed(error)) => {
                debug!(error = %error, "Previously failed terminally, acknowledging");
                metrics::record_ledger_hit("failed");
                return self.ack(delivery).await;
            }
            Ok(Reservation::InProgress { lease_expires_at }) => {
                debug!(%lease_expires_at, "Reservation held elsewhere, deferring");
                metrics::record_ledger_hit("in_progress");
                return self.defer(delivery).await;
            }
            Err(e) => {
                warn!("Ledger reservation failed: {}", e);
                return self.retry_or_exhaust(delivery, &e.to_string()).await;
            }
        }

        let started = Instant::now();
        let invocation = tokio::time::timeout(self.config.invocation_timeout, self.handler.handle(&message));
        let result = match invocation.await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::transient(format!(
                "handler exceeded invocation timeout of {:?}",
                self.config.invocation_timeout
            ))),
        };
        metrics::record_handler_latency(&message.envelope.message_type, started.elapsed().as_secs_f64());

        match result {
            Ok(value) => match self.ledger.commit(key, &value).await {
                Ok(()) => self.ack(delivery).await,
                Err(e) if e.is_conflict() => {
                    warn!("Ledger already holds a different outcome: {}", e);
                    self.ack(delivery).await
                }
                Err(e) => {
                    warn!("Failed to commit result, not acknowledging: {}", e);
                    self.retry_or_exhaust(delivery, &e.to_string()).await
                }
            },
            Err(HandlerError::Defer(reason)) => {
                debug!(reason = %reason, "Handler deferred message");
                self.release(&message, &owner).await;
                self.defer(delivery).await
            }
            Err(e) if e.is_retryable() => {
                warn!("Handler failed transiently: {}", e);
                self.release(&message, &owner).await;
                self.retry_or_exhaust(delivery, &e.to_string()).await
            }
            Err(e) => self.fail_terminally(delivery, &message, e).await,
        }
    }

    async fn fail_terminally(&self, delivery: &Delivery, message: &Message, error: HandlerError) -> WorkerResult<Outcome> {
        let class = error.class();
        let reason = error.to_string();
        error!(error_class = %class, "Handler failed terminally: {}", reason);

        if let Err(e) = self.ledger.fail(&message.envelope.idempotency_key, &reason).await {
            warn!("Failed to record ledger failure: {}", e);
        }

        if let Some(job_id) = message.job_id() {
            if let Err(e) = self.jobs.record_error(job_id, class, &reason).await {
                debug!(job_id = %job_id, "Could not record error on job: {}", e);
            }
            if class == ErrorClass::EngineFatal {
                metrics::raise_alert("dispatch", job_id.as_str(), &reason);
                if let Err(e) = self.jobs.transition_status(job_id, JobStatus::Failed).await {
                    warn!(job_id = %job_id, "Failed to mark job failed: {}", e);
                }
            }
        } else if class == ErrorClass::EngineFatal {
            metrics::raise_alert("dispatch", message.envelope.subject.as_str(), &reason);
        }

        self.dead_letter(delivery, &reason, class).await
    }

    /// Ledger lease owner for one delivery; duplicates delivered side by side
    /// get distinct owners.
    fn lease_owner(&self, delivery: &Delivery) -> String {
        format!("{}/{}", self.config.consumer_name, delivery.receipt)
    }

    async fn release(&self, message: &Message, owner: &str) {
        if let Err(e) = self
            .ledger
            .release(&message.envelope.idempotency_key, owner)
            .await
        {
            warn!("Failed to release reservation: {}", e);
        }
    }

    async fn ack(&self, delivery: &Delivery) -> WorkerResult<Outcome> {
        self.queue.ack(delivery).await?;
        Ok(Outcome::Acked)
    }

    async fn defer(&self, delivery: &Delivery) -> WorkerResult<Outcome> {
        self.queue.defer(delivery, self.config.defer_delay).await?;
        Ok(Outcome::Deferred)
    }

    async fn retry_or_exhaust(&self, delivery: &Delivery, error: &str) -> WorkerResult<Outcome> {
        if delivery.attempt >= self.config.max_retries {
            return self.dead_letter(delivery, error, ErrorClass::Transient).await;
        }
        let delay = self.retry_policy.delay_for_attempt(delivery.attempt);
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling retry");
        self.queue.retry(delivery, delay).await?;
        Ok(Outcome::Retried)
    }

    async fn dead_letter(&self, delivery: &Delivery, error: &str, class: ErrorClass) -> WorkerResult<Outcome> {
        self.queue.dead_letter(delivery, error, class).await?;
        Ok(Outcome::DeadLettered)
    }
}

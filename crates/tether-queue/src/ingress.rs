//! Ingress: the only way envelopes should enter the queue.
//!
//! Envelopes are validated, oversized payloads are moved to blob storage and
//! replaced by a reference, and batches are bounded by count and bytes.

use std::sync::Arc;

use tether_models::{Envelope, Payload};
use tether_storage::BlobStore;
use tracing::{debug, info};

use crate::error::{QueueError, QueueResult};
use crate::metrics;
use crate::queue::{MessageQueue, QueueConfig};

/// Size limits applied at ingress.
#[derive(Debug, Clone, Copy)]
pub struct IngressLimits {
    pub max_batch_count: usize,
    pub max_batch_bytes: usize,
    pub max_inline_payload_bytes: usize,
}

impl From<&QueueConfig> for IngressLimits {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_batch_count: config.max_batch_count,
            max_batch_bytes: config.max_batch_bytes,
            max_inline_payload_bytes: config.max_inline_payload_bytes,
        }
    }
}

impl Default for IngressLimits {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

pub struct Ingress {
    queue: Arc<dyn MessageQueue>,
    blobs: Arc<dyn BlobStore>,
    limits: IngressLimits,
}

impl Ingress {
    pub fn new(queue: Arc<dyn MessageQueue>, blobs: Arc<dyn BlobStore>, limits: IngressLimits) -> Self {
        Self {
            queue,
            blobs,
            limits,
        }
    }

    /// Enqueue a single envelope. Returns the broker message id.
    pub async fn enqueue(&self, envelope: Envelope) -> QueueResult<String> {
        let envelope = self.prepare(envelope).await?;
        self.queue.publish(&envelope).await
    }

    /// Enqueue a bounded batch. The whole batch is rejected if it exceeds the
    /// count or byte limit; nothing is published in that case.
    pub async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> QueueResult<Vec<String>> {
        if envelopes.len() > self.limits.max_batch_count {
            return Err(QueueError::batch_too_large(format!(
                "{} envelopes exceeds limit of {}",
                envelopes.len(),
                self.limits.max_batch_count
            )));
        }

        let mut prepared = Vec::with_capacity(envelopes.len());
        let mut total_bytes = 0usize;
        for envelope in envelopes {
            let envelope = self.prepare(envelope).await?;
            total_bytes += serde_json::to_vec(&envelope)?.len();
            prepared.push(envelope);
        }

        if total_bytes > self.limits.max_batch_bytes {
            return Err(QueueError::batch_too_large(format!(
                "{} bytes exceeds limit of {}",
                total_bytes, self.limits.max_batch_bytes
            )));
        }

        let ids = self.queue.publish_batch(&prepared).await?;
        info!(count = ids.len(), bytes = total_bytes, "Enqueued batch");
        Ok(ids)
    }

    async fn prepare(&self, mut envelope: Envelope) -> QueueResult<Envelope> {
        envelope.validate()?;

        let size = envelope.payload_size();
        if size <= self.limits.max_inline_payload_bytes {
            return Ok(envelope);
        }

        let Payload::Inline(value) = &envelope.payload else {
            return Ok(envelope);
        };
        let data = serde_json::to_vec(value)?;
        let blob_key = format!("payloads/{}", envelope.idempotency_key.as_str().replace(':', "/"));
        let blob = self.blobs.put(&blob_key, data, "application/json").await?;

        debug!(
            idempotency_key = %envelope.idempotency_key,
            size,
            uri = %blob.uri,
            "Moved oversized payload to blob storage"
        );
        metrics::record_payload_referenced(&envelope.message_type);
        envelope.payload = Payload::Reference(blob);
        Ok(envelope)
    }
}

/// Replace a referenced payload with the inline JSON it points to.
pub async fn resolve_payload(blobs: &dyn BlobStore, mut envelope: Envelope) -> QueueResult<Envelope> {
    if let Payload::Reference(blob) = &envelope.payload {
        let data = blobs.get(blob).await?;
        envelope.payload = Payload::Inline(serde_json::from_slice(&data)?);
    }
    Ok(envelope)
}

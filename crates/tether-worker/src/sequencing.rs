//! Sequence-aware handling for ordered streams.
//!
//! The broker does not preserve order, so producers that need it put a
//! sequence number in the payload. The wrapper applies a unit only when it
//! is the next one expected for its stream; later units are deferred until
//! the gap is filled and earlier ones are recognised as already applied.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tether_models::MessageBody;
use tether_store::SequenceStore;
use tracing::{debug, warn};

use crate::handler::{Handler, HandlerError, HandlerResult, Message};

pub struct SequencedHandler<H> {
    inner: H,
    sequences: Arc<dyn SequenceStore>,
}

impl<H: Handler> SequencedHandler<H> {
    pub fn new(inner: H, sequences: Arc<dyn SequenceStore>) -> Self {
        Self { inner, sequences }
    }
}

#[async_trait]
impl<H: Handler> Handler for SequencedHandler<H> {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let MessageBody::ProcessUnit(unit) = &message.body else {
            return self.inner.handle(message).await;
        };
        let Some(sequence) = unit.sequence else {
            return self.inner.handle(message).await;
        };

        let expected = self.sequences.next_expected(&unit.stream).await?;
        if sequence < expected {
            debug!(stream = %unit.stream, sequence, expected, "Sequence already applied");
            return Ok(json!({ "skipped": true, "sequence": sequence }));
        }
        if sequence > expected {
            return Err(HandlerError::defer(format!(
                "stream {} waiting for sequence {}, got {}",
                unit.stream, expected, sequence
            )));
        }

        let output = self.inner.handle(message).await?;
        if !self.sequences.advance(&unit.stream, sequence, sequence + 1).await? {
            warn!(stream = %unit.stream, sequence, "Sequence advanced concurrently");
        }
        Ok(output)
    }
}

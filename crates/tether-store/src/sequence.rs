//! Per-stream sequence tracking for ordered handlers.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreResult;

#[async_trait]
pub trait SequenceStore: Send + Sync {
    /// Next sequence number the stream expects (1 for an unseen stream).
    async fn next_expected(&self, stream: &str) -> StoreResult<u64>;

    /// Compare-and-set the expected number from `from` to `to`. Returns false
    /// if the stream has already moved.
    async fn advance(&self, stream: &str, from: u64, to: u64) -> StoreResult<bool>;
}

#[derive(Default)]
pub struct InMemorySequenceStore {
    streams: Mutex<HashMap<String, u64>>,
}

impl InMemorySequenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceStore for InMemorySequenceStore {
    async fn next_expected(&self, stream: &str) -> StoreResult<u64> {
        Ok(self.streams.lock().await.get(stream).copied().unwrap_or(1))
    }

    async fn advance(&self, stream: &str, from: u64, to: u64) -> StoreResult<bool> {
        let mut streams = self.streams.lock().await;
        let current = streams.entry(stream.to_string()).or_insert(1);
        if *current != from {
            return Ok(false);
        }
        *current = to;
        Ok(true)
    }
}

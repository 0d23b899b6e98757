//! Blob store interface and in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tether_models::BlobRef;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// External storage for payloads and artifacts too large to carry inline.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `key`. Writing the same bytes to the same key again
    /// yields an equal `BlobRef`.
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<BlobRef>;

    /// Fetch the bytes behind a reference, verifying size and checksum.
    async fn get(&self, blob: &BlobRef) -> StorageResult<Vec<u8>>;

    async fn delete(&self, blob: &BlobRef) -> StorageResult<()>;
}

/// Compare fetched bytes against the reference they were fetched for.
pub(crate) fn verify(blob: &BlobRef, data: &[u8]) -> StorageResult<()> {
    let actual = sha256_hex(data);
    if actual != blob.sha256 || data.len() as u64 != blob.size_bytes {
        return Err(StorageError::ChecksumMismatch {
            uri: blob.uri.clone(),
            expected: blob.sha256.clone(),
            actual,
        });
    }
    Ok(())
}

const MEMORY_SCHEME: &str = "mem://";

/// Process-local blob store.
#[derive(Default)]
pub struct InMemoryBlobStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn key_of(uri: &str) -> StorageResult<&str> {
        uri.strip_prefix(MEMORY_SCHEME)
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>, _content_type: &str) -> StorageResult<BlobRef> {
        let blob = BlobRef {
            uri: format!("{}{}", MEMORY_SCHEME, key),
            size_bytes: data.len() as u64,
            sha256: sha256_hex(&data),
        };
        debug!("Storing {} bytes at {}", data.len(), blob.uri);
        self.objects.write().await.insert(key.to_string(), data);
        Ok(blob)
    }

    async fn get(&self, blob: &BlobRef) -> StorageResult<Vec<u8>> {
        let key = Self::key_of(&blob.uri)?;
        let data = self
            .objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(&blob.uri))?;
        verify(blob, &data)?;
        Ok(data)
    }

    async fn delete(&self, blob: &BlobRef) -> StorageResult<()> {
        let key = Self::key_of(&blob.uri)?;
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[tokio::test]
    async fn test_put_get_roundtrip_verifies_checksum() {
        let store = InMemoryBlobStore::new();
        let blob = store
            .put("payloads/a", b"hello".to_vec(), "application/json")
            .await
            .unwrap();

        assert_eq!(blob.uri, "mem://payloads/a");
        assert_eq!(blob.size_bytes, 5);
        assert_eq!(store.get(&blob).await.unwrap(), b"hello".to_vec());
    }

    #[tokio::test]
    async fn test_tampered_reference_is_rejected() {
        let store = InMemoryBlobStore::new();
        let mut blob = store.put("k", b"data".to_vec(), "text/plain").await.unwrap();
        blob.sha256 = sha256_hex(b"other");

        let err = store.get(&blob).await.unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_blob_is_retryable() {
        let store = InMemoryBlobStore::new();
        let blob = BlobRef {
            uri: "mem://nope".to_string(),
            size_bytes: 0,
            sha256: sha256_hex(b""),
        };
        let err = store.get(&blob).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_same_bytes_same_reference() {
        let store = InMemoryBlobStore::new();
        let a = block_on(store.put("k", b"x".to_vec(), "text/plain")).unwrap();
        let b = block_on(store.put("k", b"x".to_vec(), "text/plain")).unwrap();
        assert_eq!(a, b);
        assert_eq!(block_on(store.len()), 1);
    }
}

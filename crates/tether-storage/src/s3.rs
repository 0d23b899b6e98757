//! S3-compatible blob store (AWS S3, Cloudflare R2, MinIO).

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tether_models::BlobRef;
use tracing::{debug, info};

use crate::blob::{sha256_hex, verify, BlobStore};
use crate::error::{StorageError, StorageResult};

/// Configuration for the S3 blob store.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 API endpoint URL
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    /// Region ("auto" for R2)
    pub region: String,
    /// Prefix prepended to every object key
    pub key_prefix: String,
}

impl S3Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("BLOB_ENDPOINT_URL")
                .map_err(|_| StorageError::config_error("BLOB_ENDPOINT_URL not set"))?,
            access_key_id: std::env::var("BLOB_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("BLOB_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("BLOB_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("BLOB_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("BLOB_BUCKET_NAME")
                .map_err(|_| StorageError::config_error("BLOB_BUCKET_NAME not set"))?,
            region: std::env::var("BLOB_REGION").unwrap_or_else(|_| "auto".to_string()),
            key_prefix: std::env::var("BLOB_KEY_PREFIX").unwrap_or_else(|_| "tether/".to_string()),
        })
    }

    /// Whether blob storage is configured in the environment at all.
    pub fn is_configured() -> bool {
        std::env::var("BLOB_ENDPOINT_URL").is_ok()
    }
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
    key_prefix: String,
}

impl S3BlobStore {
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "tether-blob",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        info!("Blob store configured for bucket {}", config.bucket_name);

        Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket_name,
            key_prefix: config.key_prefix,
        }
    }

    pub fn from_env() -> StorageResult<Self> {
        Ok(Self::new(S3Config::from_env()?))
    }

    fn uri_for(&self, object_key: &str) -> String {
        format!("s3://{}/{}", self.bucket, object_key)
    }

    fn object_key<'a>(&self, uri: &'a str) -> StorageResult<&'a str> {
        uri.strip_prefix("s3://")
            .and_then(|rest| rest.strip_prefix(self.bucket.as_str()))
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| StorageError::InvalidUri(uri.to_string()))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> StorageResult<BlobRef> {
        let object_key = format!("{}{}", self.key_prefix, key);
        let blob = BlobRef {
            uri: self.uri_for(&object_key),
            size_bytes: data.len() as u64,
            sha256: sha256_hex(&data),
        };
        debug!("Uploading {} bytes to {}", data.len(), blob.uri);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(ByteStream::from(data))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        Ok(blob)
    }

    async fn get(&self, blob: &BlobRef) -> StorageResult<Vec<u8>> {
        let object_key = self.object_key(&blob.uri)?;
        debug!("Downloading {}", blob.uri);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::not_found(&blob.uri)
                } else {
                    StorageError::download_failed(e.to_string())
                }
            })?;

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::download_failed(e.to_string()))?
            .into_bytes()
            .to_vec();

        verify(blob, &bytes)?;
        Ok(bytes)
    }

    async fn delete(&self, blob: &BlobRef) -> StorageResult<()> {
        let object_key = self.object_key(&blob.uri)?;

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| StorageError::delete_failed(e.to_string()))?;

        info!("Deleted {}", blob.uri);
        Ok(())
    }
}

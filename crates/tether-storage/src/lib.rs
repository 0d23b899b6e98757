//! Blob storage for the Tether pipeline.
//!
//! This crate provides:
//! - The `BlobStore` interface used for oversized envelope payloads and
//!   large step outputs
//! - An in-memory store for tests and single-process runs
//! - An S3-compatible store (AWS S3, Cloudflare R2, MinIO)

pub mod blob;
pub mod error;
pub mod s3;

pub use blob::{sha256_hex, BlobStore, InMemoryBlobStore};
pub use error::{StorageError, StorageResult};
pub use s3::{S3BlobStore, S3Config};

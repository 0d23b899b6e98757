//! Message queue for the Tether pipeline.
//!
//! This crate provides:
//! - The `MessageQueue` broker interface with per-message ack, retry, defer
//!   and dead-letter operations
//! - A Redis Streams implementation (consumer groups, delayed redelivery,
//!   bounded dead-letter stream)
//! - An in-memory implementation with the same semantics
//! - `Ingress`: validated, size/count-bounded enqueue with reference-ification
//!   of oversized payloads

pub mod error;
pub mod ingress;
pub mod memory;
pub mod metrics;
pub mod queue;
pub mod redis_streams;

pub use error::{QueueError, QueueResult};
pub use ingress::{resolve_payload, Ingress, IngressLimits};
pub use memory::InMemoryQueue;
pub use queue::{Delivery, MessageQueue, QueueConfig};
pub use redis_streams::RedisStreamQueue;

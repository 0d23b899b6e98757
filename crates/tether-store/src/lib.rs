//! Durable state for the Tether pipeline.
//!
//! This crate provides the shared mutable state of the system, each behind a
//! trait with an in-memory and a Redis implementation:
//! - `Ledger`: idempotency ledger (reserve / commit / fail / release)
//! - `JobRecordStore`: authoritative job records with atomic counters and
//!   guarded status transitions
//! - `InstanceStore`: orchestrator instance state, signals and run locks
//! - `SequenceStore`: per-stream expected sequence numbers
//! - `AuditLog`: control-plane audit trail
//!
//! Every Redis mutation is a single-key (or single-job) atomic script; there
//! are no multi-key transactions.

pub mod audit;
pub mod config;
pub mod error;
pub mod instances;
pub mod jobs;
pub mod ledger;
pub mod metrics;
pub mod redis_store;
pub mod retry;
pub mod sequence;

pub use audit::{AuditLog, InMemoryAuditLog};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use instances::{InMemoryInstanceStore, InstanceStore};
pub use jobs::{InMemoryJobStore, JobRecordStore};
pub use ledger::{guard, EffectError, GuardError, Guarded, InMemoryLedger, Ledger};
pub use redis_store::{RedisAuditLog, RedisBackend, RedisInstanceStore, RedisJobStore, RedisLedger, RedisSequenceStore};
pub use retry::{with_retry, RetryConfig};
pub use sequence::{InMemorySequenceStore, SequenceStore};

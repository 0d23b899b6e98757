//! Shared data models for the Tether job pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Message envelopes and idempotency keys
//! - Message bodies (tagged by `message_type`)
//! - Job records, statuses and error classification
//! - Idempotency ledger entries
//! - Orchestrator instances and step executions
//! - Dead-letter and audit entries

pub mod audit;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod instance;
pub mod job;
pub mod ledger;
pub mod message;

// Re-export common types
pub use audit::AuditEntry;
pub use dead_letter::DeadLetter;
pub use envelope::{BlobRef, Envelope, Payload, CURRENT_SCHEMA_VERSION};
pub use error::{ModelError, ModelResult};
pub use ids::{IdempotencyKey, InstanceId, JobId, MessageId};
pub use instance::{InstanceRecord, InstanceSignal, InstanceStatus, StepExecution, StepOutput, StepStatus};
pub use job::{ErrorClass, ErrorSummary, JobRecord, JobStatus, JobStatusView, ProgressDelta, TransitionOutcome};
pub use ledger::{LedgerContext, LedgerEntry, LedgerStatus, Reservation};
pub use message::{ControlAction, ControlJob, MessageBody, ProcessUnit, StartJob};

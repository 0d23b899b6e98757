//! Durable orchestrator: workflows of ordered, checkpointed steps executed
//! per job shard.

mod archive;
mod batch;
mod context;
mod engine;
mod workflow;

pub use archive::{ArchiveWorkflow, BlobArchiveProcessor, ManifestStep, ARCHIVE_JOB_TYPE};
pub use batch::{shard_units, UnitBatchStep, UnitOutcome, UnitProcessor};
pub use context::StepContext;
pub use engine::Engine;
pub use workflow::{Step, StepError, StepResult, Workflow, WorkflowRegistry};

//! Tether worker.
//!
//! This crate provides:
//! - The dispatch loop: receive, reserve, handle, commit, ack
//! - Handler trait, routing and sequence-aware handling
//! - The durable orchestrator engine for multi-step jobs
//! - The control plane (cancel, pause, resume)
//! - Worker configuration, logging, metrics and retry policy

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod router;
pub mod sequencing;

pub use config::{EngineConfig, WorkerConfig};
pub use control::ControlPlane;
pub use dispatch::{BatchReport, Consumer, Outcome};
pub use error::{WorkerError, WorkerResult};
pub use handler::{Handler, HandlerError, HandlerResult, Message};
pub use handlers::{ControlHandler, StartJobHandler, UnitProgressHandler};
pub use logging::JobLogger;
pub use orchestrator::{Engine, Step, StepContext, StepError, StepResult, Workflow, WorkflowRegistry};
pub use retry::RetryPolicy;
pub use router::HandlerRouter;
pub use sequencing::SequencedHandler;

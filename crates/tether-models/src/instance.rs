//! Orchestrator instance state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::envelope::BlobRef;
use crate::ids::{InstanceId, JobId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Terminated
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pending operator signal for an instance.
///
/// `Terminate` is sticky: once set it is never replaced by pause or resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSignal {
    #[default]
    None,
    Pause,
    Terminate,
}

impl InstanceSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceSignal::None => "none",
            InstanceSignal::Pause => "pause",
            InstanceSignal::Terminate => "terminate",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "pause" => InstanceSignal::Pause,
            "terminate" => InstanceSignal::Terminate,
            _ => InstanceSignal::None,
        }
    }

    /// Combine a new request with the current signal.
    pub fn merge(self, requested: InstanceSignal) -> InstanceSignal {
        match (self, requested) {
            (InstanceSignal::Terminate, _) => InstanceSignal::Terminate,
            (_, requested) => requested,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    FailedRetrying,
    FailedTerminal,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::FailedRetrying => "failed_retrying",
            StepStatus::FailedTerminal => "failed_terminal",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted output of a succeeded step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StepOutput {
    Inline(Value),
    /// Large artifact kept in blob storage
    Pointer(BlobRef),
}

impl StepOutput {
    pub fn inline(&self) -> Option<&Value> {
        match self {
            StepOutput::Inline(value) => Some(value),
            StepOutput::Pointer(_) => None,
        }
    }
}

/// Execution state of one step within an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_name: String,
    pub status: StepStatus,
    /// Every run of the step, including runs that stopped at a checkpoint
    pub attempt_count: u32,
    /// Runs that ended in an error; bounds the retries
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<StepOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Resume position inside the step (next sub-batch index)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepExecution {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::NotStarted,
            attempt_count: 0,
            failure_count: 0,
            output: None,
            last_error: None,
            cursor: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// One orchestrator instance: a job shard executed as ordered steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance_id: InstanceId,
    pub job_id: JobId,
    pub job_type: String,
    pub shard: u32,
    pub shard_count: u32,
    #[serde(default)]
    pub parameters: Value,
    pub status: InstanceStatus,
    pub steps: Vec<StepExecution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InstanceRecord {
    pub fn new(
        job_id: JobId,
        job_type: impl Into<String>,
        shard: u32,
        shard_count: u32,
        parameters: Value,
        step_names: &[String],
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: InstanceId::for_shard(&job_id, shard),
            job_id,
            job_type: job_type.into(),
            shard,
            shard_count: shard_count.max(1),
            parameters,
            status: InstanceStatus::Running,
            steps: step_names.iter().map(StepExecution::new).collect(),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    /// Index of the first step that has not succeeded.
    pub fn resume_index(&self) -> usize {
        self.steps
            .iter()
            .position(|s| s.status != StepStatus::Succeeded)
            .unwrap_or(self.steps.len())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_name.as_str()).collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

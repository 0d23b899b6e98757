//! Job records: the authoritative, externally queryable state of a job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ids::JobId;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Record created, no instance has started yet
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Paused,
        JobStatus::Completed,
        JobStatus::Cancelled,
        JobStatus::Failed,
    ];

    /// Get string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    /// Terminal statuses are final sinks.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match self {
            Pending => matches!(to, Running | Paused | Cancelled | Failed | Completed),
            Running => matches!(to, Paused | Completed | Cancelled | Failed),
            Paused => matches!(to, Running | Cancelled | Failed),
            Completed | Cancelled | Failed => false,
        }
    }

    /// Statuses from which `to` may be entered.
    pub fn allowed_sources(to: JobStatus) -> Vec<JobStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of a guarded status transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { from: JobStatus },
    /// Already in the requested status
    Unchanged,
    Rejected { current: JobStatus },
}

impl TransitionOutcome {
    pub fn is_rejected(&self) -> bool {
        matches!(self, TransitionOutcome::Rejected { .. })
    }
}

/// Error taxonomy, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry with backoff
    Transient,
    /// Malformed input, never retried
    Validation,
    /// The action cannot succeed
    BusinessTerminal,
    /// Orchestrator state is unrecoverable
    EngineFatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::BusinessTerminal => "business_terminal",
            ErrorClass::EngineFatal => "engine_fatal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            ErrorClass::Transient,
            ErrorClass::Validation,
            ErrorClass::BusinessTerminal,
            ErrorClass::EngineFatal,
        ]
        .into_iter()
        .find(|class| class.as_str() == s)
    }

    /// Numeric severity, higher is worse.
    pub fn severity(&self) -> u8 {
        *self as u8
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Most severe error known for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub class: ErrorClass,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

/// Counter increments applied atomically to a job record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDelta {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// When set, the delta is applied at most once per job for this token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
}

impl ProgressDelta {
    pub fn units(succeeded: u64, failed: u64) -> Self {
        Self {
            processed: succeeded + failed,
            succeeded,
            failed,
            checkpoint: None,
        }
    }

    pub fn at_checkpoint(mut self, token: impl Into<String>) -> Self {
        self.checkpoint = Some(token.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.processed == 0 && self.succeeded == 0 && self.failed == 0
    }
}

/// Authoritative job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,

    pub total_units: u64,
    pub processed_units: u64,
    pub succeeded_units: u64,
    pub failed_units: u64,

    #[serde(default)]
    pub parameters: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_pointer: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,

    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    /// Number of orchestrator instances (shards) the job runs as
    pub instance_count: u32,

    /// Instances that reached a terminal state
    #[serde(default)]
    pub finished_instances: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(job_id: JobId, job_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            job_type: job_type.into(),
            status: JobStatus::Pending,
            total_units: 0,
            processed_units: 0,
            succeeded_units: 0,
            failed_units: 0,
            parameters: Value::Null,
            result_pointer: None,
            error_summary: None,
            cancel_requested: false,
            cancel_reason: None,
            instance_count: 1,
            finished_instances: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_total_units(mut self, total_units: u64) -> Self {
        self.total_units = total_units;
        self
    }

    pub fn with_instance_count(mut self, instance_count: u32) -> Self {
        self.instance_count = instance_count.max(1);
        self
    }

    /// Apply a guarded status transition in place.
    pub fn transition(&mut self, to: JobStatus) -> TransitionOutcome {
        if self.status == to {
            return TransitionOutcome::Unchanged;
        }
        if !self.status.can_transition_to(to) {
            return TransitionOutcome::Rejected {
                current: self.status,
            };
        }

        let from = self.status;
        let now = Utc::now();
        self.status = to;
        self.updated_at = now;
        if to == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to.is_terminal() {
            self.finished_at = Some(now);
        }
        TransitionOutcome::Applied { from }
    }

    /// Like `transition`, but only leaves `from`. Any other current status is
    /// rejected even when the table would allow the move.
    pub fn transition_from(&mut self, from: JobStatus, to: JobStatus) -> TransitionOutcome {
        if self.status != to && self.status != from {
            return TransitionOutcome::Rejected {
                current: self.status,
            };
        }
        self.transition(to)
    }

    pub fn apply_progress(&mut self, delta: &ProgressDelta) {
        self.processed_units += delta.processed;
        self.succeeded_units += delta.succeeded;
        self.failed_units += delta.failed;
        self.updated_at = Utc::now();
    }

    /// Keep the most severe error; the first error of a given severity wins.
    ///
    /// Returns true when the summary changed.
    pub fn record_error(&mut self, class: ErrorClass, message: impl Into<String>) -> bool {
        let replace = match &self.error_summary {
            Some(existing) => class > existing.class,
            None => true,
        };
        if replace {
            self.error_summary = Some(ErrorSummary {
                class,
                message: message.into(),
                recorded_at: Utc::now(),
            });
            self.updated_at = Utc::now();
        }
        replace
    }

    pub fn request_cancel(&mut self, reason: Option<String>) {
        if !self.cancel_requested {
            self.cancel_requested = true;
            self.cancel_reason = reason;
            self.updated_at = Utc::now();
        }
    }

    /// Progress percentage (0-100).
    pub fn percent_complete(&self) -> f64 {
        if self.total_units == 0 {
            return if self.status == JobStatus::Completed { 100.0 } else { 0.0 };
        }
        let pct = self.processed_units as f64 / self.total_units as f64 * 100.0;
        pct.min(100.0)
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView::from(self)
    }
}

/// Read-only job status for external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub total_units: u64,
    pub processed_units: u64,
    pub succeeded_units: u64,
    pub failed_units: u64,
    pub percent_complete: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<ErrorSummary>,
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_pointer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&JobRecord> for JobStatusView {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            job_type: record.job_type.clone(),
            status: record.status,
            total_units: record.total_units,
            processed_units: record.processed_units,
            succeeded_units: record.succeeded_units,
            failed_units: record.failed_units,
            percent_complete: record.percent_complete(),
            error_summary: record.error_summary.clone(),
            cancel_requested: record.cancel_requested,
            result_pointer: record.result_pointer.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
        }
    }
}

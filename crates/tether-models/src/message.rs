//! Message bodies, tagged by `message_type`.
//!
//! Bodies reject unknown fields rather than silently dropping them, so a
//! producer on a newer schema fails loudly instead of being half-understood.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{ModelError, ModelResult};
use crate::ids::{IdempotencyKey, JobId};

/// Start (or re-announce) a job and its orchestrator instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartJob {
    pub job_id: JobId,
    pub job_type: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub total_units: u64,
    /// Number of orchestrator instances the job is split across
    #[serde(default = "default_shards")]
    pub shards: u32,
}

fn default_shards() -> u32 {
    1
}

/// Operator control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    Pause,
    Resume,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::Cancel => "cancel",
            ControlAction::Pause => "pause",
            ControlAction::Resume => "resume",
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cancel, pause or resume a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlJob {
    pub job_id: JobId,
    pub action: ControlAction,
    /// Caller-supplied id; repeating a request reuses it
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

/// One short unit of work handled directly by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessUnit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Ordering scope for `sequence`
    pub stream: String,
    pub unit_id: String,
    /// 1-based position within `stream`, when the handler needs ordering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

/// Tagged union of every message the pipeline understands.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    StartJob(StartJob),
    ControlJob(ControlJob),
    ProcessUnit(ProcessUnit),
}

impl MessageBody {
    pub const START_JOB: &'static str = "job.start";
    pub const CONTROL_JOB: &'static str = "job.control";
    pub const PROCESS_UNIT: &'static str = "unit.process";

    pub fn message_type(&self) -> &'static str {
        match self {
            MessageBody::StartJob(_) => Self::START_JOB,
            MessageBody::ControlJob(_) => Self::CONTROL_JOB,
            MessageBody::ProcessUnit(_) => Self::PROCESS_UNIT,
        }
    }

    /// Decode a payload for the given message type.
    pub fn decode(message_type: &str, value: &Value) -> ModelResult<Self> {
        let invalid = |e: serde_json::Error| ModelError::invalid_payload(message_type, e.to_string());
        match message_type {
            Self::START_JOB => serde_json::from_value(value.clone())
                .map(MessageBody::StartJob)
                .map_err(invalid),
            Self::CONTROL_JOB => serde_json::from_value(value.clone())
                .map(MessageBody::ControlJob)
                .map_err(invalid),
            Self::PROCESS_UNIT => serde_json::from_value(value.clone())
                .map(MessageBody::ProcessUnit)
                .map_err(invalid),
            other => Err(ModelError::UnknownMessageType(other.to_string())),
        }
    }

    pub fn to_value(&self) -> ModelResult<Value> {
        let result = match self {
            MessageBody::StartJob(b) => serde_json::to_value(b),
            MessageBody::ControlJob(b) => serde_json::to_value(b),
            MessageBody::ProcessUnit(b) => serde_json::to_value(b),
        };
        result.map_err(|e| ModelError::invalid_payload(self.message_type(), e.to_string()))
    }

    /// The fields that identify the logical action, independent of delivery.
    pub fn business_identity(&self) -> Vec<String> {
        match self {
            MessageBody::StartJob(b) => vec![b.job_id.to_string()],
            MessageBody::ControlJob(b) => vec![
                b.job_id.to_string(),
                b.action.as_str().to_string(),
                b.request_id.clone(),
            ],
            MessageBody::ProcessUnit(b) => vec![b.stream.clone(), b.unit_id.clone()],
        }
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::derive(self.message_type(), &self.business_identity())
    }

    /// Job this message belongs to, if any.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            MessageBody::StartJob(b) => Some(&b.job_id),
            MessageBody::ControlJob(b) => Some(&b.job_id),
            MessageBody::ProcessUnit(b) => b.job_id.as_ref(),
        }
    }
}

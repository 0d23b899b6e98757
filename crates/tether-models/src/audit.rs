//! Control-plane audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::JobId;
use crate::message::ControlAction;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub job_id: JobId,
    pub action: ControlAction,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// What the command did, e.g. "applied" or "noop:terminal"
    pub outcome: String,
    /// Instances the engine primitive was invoked on
    #[serde(default)]
    pub instances: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

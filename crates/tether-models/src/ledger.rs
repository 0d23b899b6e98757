//! Idempotency ledger entries.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ids::IdempotencyKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Pending,
    Succeeded,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Succeeded => "succeeded",
            LedgerStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(LedgerStatus::Pending),
            "succeeded" => Some(LedgerStatus::Succeeded),
            "failed" => Some(LedgerStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, LedgerStatus::Pending)
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Back-pointers from a ledger entry to the work that created it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
}

/// One entry per idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub key: IdempotencyKey,
    pub status: LedgerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Worker holding the pending reservation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Number of reservations granted for this key
    pub attempts: u32,
    #[serde(default)]
    pub context: LedgerContext,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Retention deadline; the entry may be dropped after this
    pub expires_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn pending(
        key: IdempotencyKey,
        owner: &str,
        lease: Duration,
        retention: Duration,
        context: LedgerContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            key,
            status: LedgerStatus::Pending,
            result: None,
            last_error: None,
            owner: Some(owner.to_string()),
            lease_expires_at: Some(now + lease),
            attempts: 1,
            context,
            created_at: now,
            updated_at: now,
            expires_at: now + retention,
        }
    }

    /// A pending lease held by someone other than `owner` that has not expired.
    pub fn is_leased_by_other(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.status == LedgerStatus::Pending
            && self.owner.as_deref().is_some_and(|o| o != owner)
            && self.lease_expires_at.is_some_and(|at| at > now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of an atomic check-and-reserve.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key and must commit, fail or release it
    Reserved,
    /// Replay: the action already happened, here is its original result
    AlreadySucceeded(Value),
    AlreadyFailed(String),
    /// Another worker holds a live lease on the key
    InProgress { lease_expires_at: DateTime<Utc> },
}

impl Reservation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reservation::Reserved => "reserved",
            Reservation::AlreadySucceeded(_) => "already_succeeded",
            Reservation::AlreadyFailed(_) => "already_failed",
            Reservation::InProgress { .. } => "in_progress",
        }
    }
}

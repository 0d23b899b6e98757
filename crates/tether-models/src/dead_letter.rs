//! Dead-letter entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::job::ErrorClass;

/// A message that will not be processed again without operator action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Identifier within the dead-letter path (used for redrive/purge)
    pub id: String,
    pub envelope: Envelope,
    pub attempt_count: u32,
    pub last_error: String,
    pub error_class: ErrorClass,
    pub dead_lettered_at: DateTime<Utc>,
}

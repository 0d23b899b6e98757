//! Worker metrics.
//!
//! - Message outcomes and handler latency
//! - Ledger replays seen by the dispatcher
//! - Step attempts and failures
//! - Alerts for engine-fatal conditions

use metrics::{counter, histogram};
use tracing::error;

// =============================================================================
// Metric Names
// =============================================================================

pub mod names {
    /// Messages received by message type.
    pub const MESSAGES_RECEIVED_TOTAL: &str = "tether_messages_received_total";

    /// Message outcomes (acked, retried, deferred, dead_lettered).
    pub const MESSAGE_OUTCOMES_TOTAL: &str = "tether_message_outcomes_total";

    /// Deliveries short-circuited by the ledger.
    pub const LEDGER_HITS_TOTAL: &str = "tether_ledger_hits_total";

    /// Handler latency in seconds by message type.
    pub const HANDLER_LATENCY_SECONDS: &str = "tether_handler_latency_seconds";

    /// Step attempts by step name.
    pub const STEP_ATTEMPTS_TOTAL: &str = "tether_step_attempts_total";

    /// Step failures by step name and error class.
    pub const STEP_FAILURES_TOTAL: &str = "tether_step_failures_total";

    /// Progress checkpoints written.
    pub const CHECKPOINTS_TOTAL: &str = "tether_checkpoints_total";

    /// Alerts raised by component.
    pub const ALERTS_TOTAL: &str = "tether_alerts_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_received(message_type: &str) {
    counter!(names::MESSAGES_RECEIVED_TOTAL, "message_type" => message_type.to_string()).increment(1);
}

pub fn record_outcome(message_type: &str, outcome: &str) {
    counter!(
        names::MESSAGE_OUTCOMES_TOTAL,
        "message_type" => message_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_ledger_hit(status: &str) {
    counter!(names::LEDGER_HITS_TOTAL, "status" => status.to_string()).increment(1);
}

pub fn record_handler_latency(message_type: &str, seconds: f64) {
    histogram!(names::HANDLER_LATENCY_SECONDS, "message_type" => message_type.to_string()).record(seconds);
}

pub fn record_step_attempt(step: &str) {
    counter!(names::STEP_ATTEMPTS_TOTAL, "step" => step.to_string()).increment(1);
}

pub fn record_step_failure(step: &str, class: &str) {
    counter!(
        names::STEP_FAILURES_TOTAL,
        "step" => step.to_string(),
        "class" => class.to_string()
    )
    .increment(1);
}

pub fn record_checkpoint(applied: bool) {
    counter!(names::CHECKPOINTS_TOTAL, "applied" => applied.to_string()).increment(1);
}

/// Log an alert-level event and count it.
pub fn raise_alert(component: &str, subject: &str, reason: &str) {
    error!(alert = true, component, subject, "ALERT: {}", reason);
    counter!(names::ALERTS_TOTAL, "component" => component.to_string()).increment(1);
}

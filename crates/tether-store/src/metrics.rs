//! Store metrics.
//!
//! - Operation latency by operation name
//! - Retry counters
//! - Ledger reservation outcomes (replays are "hits")

use metrics::{counter, histogram};

// =============================================================================
// Metric Names
// =============================================================================

pub mod names {
    /// Store operations by operation and outcome.
    pub const OPERATIONS_TOTAL: &str = "tether_store_operations_total";

    /// Total retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "tether_store_retries_total";

    /// Operation latency in seconds by operation.
    pub const LATENCY_SECONDS: &str = "tether_store_latency_seconds";

    /// Ledger reservations by outcome.
    pub const LEDGER_RESERVATIONS_TOTAL: &str = "tether_ledger_reservations_total";
}

// =============================================================================
// Recording Functions
// =============================================================================

pub fn record_operation(operation: &str, ok: bool, latency_ms: f64) {
    counter!(
        names::OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "outcome" => if ok { "ok" } else { "error" }
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "operation" => operation.to_string()
    )
    .record(latency_ms / 1000.0);
}

pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

pub fn record_reservation(outcome: &str) {
    counter!(
        names::LEDGER_RESERVATIONS_TOTAL,
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

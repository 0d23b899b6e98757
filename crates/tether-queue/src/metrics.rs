//! Queue metrics.

use metrics::counter;

pub mod names {
    pub const MESSAGES_PUBLISHED: &str = "tether_queue_messages_published_total";
    pub const MESSAGES_DEAD_LETTERED: &str = "tether_queue_messages_dead_lettered_total";
    pub const DEAD_LETTERS_REDRIVEN: &str = "tether_queue_dead_letters_redriven_total";
    pub const PAYLOADS_REFERENCED: &str = "tether_queue_payloads_referenced_total";
}

pub fn record_published(message_type: &str, count: usize) {
    counter!(names::MESSAGES_PUBLISHED, "message_type" => message_type.to_string())
        .increment(count as u64);
}

pub fn record_dead_lettered(message_type: &str, error_class: &str) {
    counter!(
        names::MESSAGES_DEAD_LETTERED,
        "message_type" => message_type.to_string(),
        "error_class" => error_class.to_string()
    )
    .increment(1);
}

pub fn record_redriven() {
    counter!(names::DEAD_LETTERS_REDRIVEN).increment(1);
}

pub fn record_payload_referenced(message_type: &str) {
    counter!(names::PAYLOADS_REFERENCED, "message_type" => message_type.to_string()).increment(1);
}

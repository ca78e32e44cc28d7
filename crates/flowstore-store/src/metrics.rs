// Store metrics
// Recorded through the `metrics` facade; the binary decides where they go.

use metrics::{counter, gauge};

pub const BATCHES_SUBMITTED: &str = "flowstore_batches_submitted_total";
pub const BATCHES_FORWARDED: &str = "flowstore_batches_forwarded_total";
pub const PENDING_COMPLETIONS: &str = "flowstore_pending_completions";
pub const COMPLETIONS_EXPIRED: &str = "flowstore_completions_expired_total";
pub const REJECTED_MUTATIONS: &str = "flowstore_rejected_mutations_total";

pub fn record_batch_submitted() {
    counter!(BATCHES_SUBMITTED).increment(1);
}

pub fn record_batch_forwarded(target: &str) {
    counter!(BATCHES_FORWARDED, "target" => target.to_string()).increment(1);
}

pub fn set_pending_completions(count: usize) {
    gauge!(PENDING_COMPLETIONS).set(count as f64);
}

pub fn record_completions_expired(count: u64) {
    counter!(COMPLETIONS_EXPIRED).increment(count);
}

pub fn record_rejected_mutation(operation: &'static str) {
    counter!(REJECTED_MUTATIONS, "operation" => operation).increment(1);
}

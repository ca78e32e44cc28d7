// Metric descriptions for the flow rule store

use metrics::{describe_counter, describe_gauge};

use flowstore_store::metrics::{
    BATCHES_FORWARDED, BATCHES_SUBMITTED, COMPLETIONS_EXPIRED, PENDING_COMPLETIONS,
    REJECTED_MUTATIONS,
};

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    describe_counter!(
        BATCHES_SUBMITTED,
        "Total number of batches submitted to this node, including empty and forwarded batches"
    );
    describe_counter!(
        BATCHES_FORWARDED,
        "Total number of batches forwarded to a remote master"
    );
    describe_gauge!(
        PENDING_COMPLETIONS,
        "Number of batches waiting for the delegate to complete them"
    );
    describe_counter!(
        COMPLETIONS_EXPIRED,
        "Total number of pending completions dropped after the timeout"
    );
    describe_counter!(
        REJECTED_MUTATIONS,
        "Total number of direct mutations rejected on a non-master node"
    );

    tracing::info!("Metrics initialized");
}

// Rule application delegate
// The collaborator that realizes staged batches, for example by programming
// the device, and later reports back through `batch_operation_complete`.

use flowstore_api::FlowRuleBatchRequest;

#[async_trait::async_trait]
pub trait FlowRuleStoreDelegate: Send + Sync {
    /// Called once per staged batch; must return promptly and report the
    /// outcome later
    async fn batch_requested(&self, request: FlowRuleBatchRequest);
}

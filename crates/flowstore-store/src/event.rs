// Store event stream
// One bounded queue per subscriber. Events are published in the order the
// store produces them; a subscriber that falls behind loses the oldest
// events and observes `RecvError::Lagged`. Producers never block.

use tokio::sync::broadcast;
use tracing::trace;

use flowstore_api::{CompletedBatchOperation, FlowRuleBatchRequest, FlowRuleEvent};
use flowstore_common::BatchId;

/// Event published by the flow rule store
#[derive(Clone, Debug)]
pub enum FlowStoreEvent {
    /// A batch was staged locally and handed to the delegate
    BatchRequested(FlowRuleBatchRequest),
    /// The delegate reported the outcome of a batch
    BatchCompleted {
        batch_id: BatchId,
        result: CompletedBatchOperation,
    },
    /// A single rule was added, updated or removed
    Rule(FlowRuleEvent),
}

impl FlowStoreEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            FlowStoreEvent::BatchRequested(_) => "BATCH_REQUESTED",
            FlowStoreEvent::BatchCompleted { .. } => "BATCH_COMPLETED",
            FlowStoreEvent::Rule(_) => "RULE",
        }
    }
}

pub struct EventDispatcher {
    sender: broadcast::Sender<FlowStoreEvent>,
}

impl EventDispatcher {
    pub fn new(queue_size: usize) -> Self {
        let (sender, _) = broadcast::channel(queue_size.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowStoreEvent> {
        self.sender.subscribe()
    }

    /// Publish to every current subscriber, returning how many were reached
    pub fn publish(&self, event: FlowStoreEvent) -> usize {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                trace!(kind, "No store event subscribers");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn completed(id: u64) -> FlowStoreEvent {
        FlowStoreEvent::BatchCompleted {
            batch_id: BatchId::new(id),
            result: CompletedBatchOperation::succeeded(),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let dispatcher = EventDispatcher::new(4);
        assert_eq!(dispatcher.publish(completed(1)), 0);
    }

    #[test]
    fn test_lagging_subscriber_drops_oldest() {
        let dispatcher = EventDispatcher::new(2);
        let mut rx = dispatcher.subscribe();

        for id in 1..=3 {
            dispatcher.publish(completed(id));
        }

        assert!(matches!(rx.try_recv(), Err(TryRecvError::Lagged(1))));
        match rx.try_recv().unwrap() {
            FlowStoreEvent::BatchCompleted { batch_id, .. } => assert_eq!(batch_id, BatchId::new(2)),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

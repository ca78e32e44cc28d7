// Completion registry
// Correlates a batch id with the caller waiting for its outcome. Entries
// live until resolved or until the completion timeout passes.

use std::{
    collections::HashSet,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use dashmap::DashMap;
use futures::{FutureExt, future::BoxFuture};
use tokio::{sync::oneshot, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use flowstore_api::{CompletedBatchOperation, FlowRule};
use flowstore_common::{BatchId, DeviceId, FlowStoreError, Result};

use crate::metrics;

/// Work staged on the table for a batch, kept for reconciliation
#[derive(Clone, Debug, Default)]
pub struct StagedBatch {
    pub device_id: Option<DeviceId>,
    pub to_add: Vec<FlowRule>,
    pub to_remove: Vec<FlowRule>,
}

/// Handle to the eventual outcome of a batch
///
/// Resolves to [`FlowStoreError::CompletionDropped`] if the registry entry
/// expires or the store stops before the delegate reports back.
pub struct BatchFuture {
    batch_id: Option<BatchId>,
    inner: BoxFuture<'static, Result<CompletedBatchOperation>>,
}

impl BatchFuture {
    /// An already completed batch
    pub fn ready(result: Result<CompletedBatchOperation>) -> Self {
        Self {
            batch_id: None,
            inner: futures::future::ready(result).boxed(),
        }
    }

    fn pending(batch_id: BatchId, rx: oneshot::Receiver<CompletedBatchOperation>) -> Self {
        Self {
            batch_id: Some(batch_id),
            inner: async move { rx.await.map_err(|_| FlowStoreError::CompletionDropped(batch_id)) }
                .boxed(),
        }
    }

    /// Batch id allocated for this handle; `None` when nothing was staged locally
    pub fn batch_id(&self) -> Option<BatchId> {
        self.batch_id
    }

    /// Report `rules` as failed on top of whatever the batch resolves to
    pub fn with_failed_rules(self, rules: HashSet<FlowRule>) -> Self {
        if rules.is_empty() {
            return self;
        }
        Self {
            batch_id: self.batch_id,
            inner: self
                .inner
                .map(move |result| {
                    result.map(|mut completed| {
                        completed.success = false;
                        completed.failed_rules.extend(rules);
                        completed
                    })
                })
                .boxed(),
        }
    }
}

impl Future for BatchFuture {
    type Output = Result<CompletedBatchOperation>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl std::fmt::Debug for BatchFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFuture")
            .field("batch_id", &self.batch_id)
            .finish()
    }
}

/// A registered, not yet resolved completion
pub struct PendingCompletion {
    sender: oneshot::Sender<CompletedBatchOperation>,
    staged: StagedBatch,
    registered_at: Instant,
}

impl PendingCompletion {
    pub fn staged(&self) -> &StagedBatch {
        &self.staged
    }

    /// Deliver the outcome to the waiting caller
    pub fn complete(self, result: CompletedBatchOperation) {
        // The caller may have stopped waiting
        let _ = self.sender.send(result);
    }

    fn is_expired(&self, timeout: Duration) -> bool {
        self.registered_at.elapsed() >= timeout
    }
}

/// Pending batch completions keyed by batch id
pub struct CompletionRegistry {
    pending: DashMap<BatchId, PendingCompletion>,
    timeout: Duration,
}

impl CompletionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Register a batch and return the caller's handle
    pub fn register(&self, batch_id: BatchId, staged: StagedBatch) -> BatchFuture {
        let (sender, rx) = oneshot::channel();
        self.pending.insert(
            batch_id,
            PendingCompletion {
                sender,
                staged,
                registered_at: Instant::now(),
            },
        );
        metrics::set_pending_completions(self.pending.len());
        debug!(batch_id = %batch_id, "Registered pending completion");

        BatchFuture::pending(batch_id, rx)
    }

    /// Remove a pending completion so it can be resolved exactly once
    ///
    /// Returns `None` if the batch is unknown, already taken, or expired.
    pub fn take(&self, batch_id: BatchId) -> Option<PendingCompletion> {
        let (_, pending) = self.pending.remove(&batch_id)?;
        metrics::set_pending_completions(self.pending.len());

        if pending.is_expired(self.timeout) {
            warn!(batch_id = %batch_id, "Completion arrived after expiry, dropping it");
            metrics::record_completions_expired(1);
            return None;
        }
        Some(pending)
    }

    /// Resolve a batch; a no-op if it is unknown, resolved or expired
    pub fn resolve(&self, batch_id: BatchId, result: CompletedBatchOperation) -> bool {
        match self.take(batch_id) {
            Some(pending) => {
                pending.complete(result);
                true
            }
            None => false,
        }
    }

    /// Drop every expired entry, failing its handle
    pub fn expire(&self) -> usize {
        let timeout = self.timeout;
        let before = self.pending.len();
        self.pending.retain(|batch_id, pending| {
            let keep = !pending.is_expired(timeout);
            if !keep {
                warn!(
                    batch_id = %batch_id,
                    "Batch was not completed within {:?}, dropping it",
                    timeout
                );
            }
            keep
        });

        let expired = before.saturating_sub(self.pending.len());
        if expired > 0 {
            metrics::record_completions_expired(expired as u64);
            metrics::set_pending_completions(self.pending.len());
        }
        expired
    }

    /// Drop every pending entry
    pub fn fail_all(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        metrics::set_pending_completions(0);
        count
    }

    pub fn contains(&self, batch_id: BatchId) -> bool {
        self.pending.contains_key(&batch_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Spawn the background task that sweeps expired entries
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let expired = registry.expire();
                if expired > 0 {
                    debug!(count = expired, "Cleaned up expired completions");
                }
            }
        });
        info!(
            "Started completion sweeper (timeout {:?}, interval {:?})",
            self.timeout, interval
        );
        handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstore_common::ApplicationId;

    fn staged() -> StagedBatch {
        StagedBatch {
            device_id: Some(DeviceId::new("of:1")),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let registry = CompletionRegistry::new(Duration::from_secs(60));
        let handle = registry.register(BatchId::new(1), staged());
        assert_eq!(handle.batch_id(), Some(BatchId::new(1)));
        assert!(registry.contains(BatchId::new(1)));

        assert!(registry.resolve(BatchId::new(1), CompletedBatchOperation::succeeded()));
        assert!(!registry.resolve(BatchId::new(1), CompletedBatchOperation::succeeded()));
        assert!(registry.is_empty());

        let result = handle.await.unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn test_unknown_batch_is_noop() {
        let registry = CompletionRegistry::new(Duration::from_secs(60));
        assert!(!registry.resolve(BatchId::new(42), CompletedBatchOperation::succeeded()));
        assert!(registry.take(BatchId::new(42)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_is_not_resolved() {
        let registry = CompletionRegistry::new(Duration::from_secs(5));
        let handle = registry.register(BatchId::new(1), staged());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!registry.resolve(BatchId::new(1), CompletedBatchOperation::succeeded()));

        match handle.await {
            Err(FlowStoreError::CompletionDropped(id)) => assert_eq!(id, BatchId::new(1)),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired() {
        let registry = Arc::new(CompletionRegistry::new(Duration::from_secs(5)));
        let sweeper = registry.start_sweeper(Duration::from_secs(1));
        let _early = registry.register(BatchId::new(1), staged());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let _late = registry.register(BatchId::new(2), staged());
        assert_eq!(registry.len(), 2);

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!registry.contains(BatchId::new(1)));
        assert!(registry.contains(BatchId::new(2)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(registry.is_empty());
        sweeper.abort();
    }

    #[tokio::test]
    async fn test_fail_all_drops_handles() {
        let registry = CompletionRegistry::new(Duration::from_secs(60));
        let handle = registry.register(BatchId::new(7), staged());

        assert_eq!(registry.fail_all(), 1);
        assert!(matches!(
            handle.await,
            Err(FlowStoreError::CompletionDropped(_))
        ));
    }

    #[tokio::test]
    async fn test_ready_handle() {
        let handle = BatchFuture::ready(Ok(CompletedBatchOperation::succeeded()));
        assert!(handle.batch_id().is_none());
        assert!(handle.await.unwrap().failed_rules.is_empty());
    }

    #[tokio::test]
    async fn test_with_failed_rules_merges_into_result() {
        let rule = FlowRule::builder(DeviceId::new("of:2"), ApplicationId::new(1, "test"))
            .priority(5)
            .build();
        let registry = CompletionRegistry::new(Duration::from_secs(60));
        let handle = registry
            .register(BatchId::new(3), staged())
            .with_failed_rules(HashSet::from([rule.clone()]));
        assert_eq!(handle.batch_id(), Some(BatchId::new(3)));

        registry.resolve(BatchId::new(3), CompletedBatchOperation::succeeded());
        let result = handle.await.unwrap();
        assert!(!result.success);
        assert!(result.is_failed(&rule));

        // An empty set leaves the outcome untouched
        let handle = BatchFuture::ready(Ok(CompletedBatchOperation::succeeded()))
            .with_failed_rules(HashSet::new());
        assert!(handle.await.unwrap().success);
    }
}

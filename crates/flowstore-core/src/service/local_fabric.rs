// In-process cluster transport
// Connects messengers of several nodes living in one process. Used by the
// simulation binary and by multi-node tests; supports partitions and delays.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use flowstore_api::MessageSubject;
use flowstore_common::NodeId;

use super::messenger::{ClusterMessageHandler, ClusterMessenger, MessagingError};

/// Per-node inbound side of the fabric
struct NodeMailbox {
    handlers: DashMap<MessageSubject, Arc<dyn ClusterMessageHandler>>,
    reachable: AtomicBool,
    /// Artificial processing delay in milliseconds
    delay_ms: AtomicU64,
}

impl NodeMailbox {
    fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            reachable: AtomicBool::new(true),
            delay_ms: AtomicU64::new(0),
        }
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Shared in-process message fabric
#[derive(Default)]
pub struct LocalClusterFabric {
    nodes: DashMap<NodeId, Arc<NodeMailbox>>,
}

impl LocalClusterFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node and return its messenger
    pub fn join(self: &Arc<Self>, node_id: NodeId) -> Arc<LocalClusterMessenger> {
        let mailbox = self
            .nodes
            .entry(node_id.clone())
            .or_insert_with(|| Arc::new(NodeMailbox::new()))
            .clone();
        info!(node = %node_id, "Node joined local cluster fabric");

        Arc::new(LocalClusterMessenger {
            local: node_id,
            fabric: self.clone(),
            mailbox,
        })
    }

    /// Detach a node; requests to it fail as unreachable
    pub fn leave(&self, node_id: &NodeId) {
        self.nodes.remove(node_id);
        info!(node = %node_id, "Node left local cluster fabric");
    }

    /// Partition a node from (or heal it into) the rest of the cluster
    pub fn set_reachable(&self, node_id: &NodeId, reachable: bool) {
        if let Some(mailbox) = self.nodes.get(node_id) {
            mailbox.reachable.store(reachable, Ordering::SeqCst);
            debug!(node = %node_id, reachable, "Changed node reachability");
        }
    }

    /// Delay every request handled by a node
    pub fn set_delay(&self, node_id: &NodeId, delay: Duration) {
        if let Some(mailbox) = self.nodes.get(node_id) {
            mailbox
                .delay_ms
                .store(delay.as_millis() as u64, Ordering::SeqCst);
        }
    }

    pub fn members(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|e| e.key().clone()).collect()
    }

    fn mailbox(&self, node_id: &NodeId) -> Option<Arc<NodeMailbox>> {
        self.nodes.get(node_id).map(|m| m.clone())
    }
}

/// Messenger of one node attached to a [`LocalClusterFabric`]
pub struct LocalClusterMessenger {
    local: NodeId,
    fabric: Arc<LocalClusterFabric>,
    mailbox: Arc<NodeMailbox>,
}

#[async_trait::async_trait]
impl ClusterMessenger for LocalClusterMessenger {
    fn local_node(&self) -> &NodeId {
        &self.local
    }

    async fn send_and_await(
        &self,
        target: &NodeId,
        subject: MessageSubject,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, MessagingError> {
        let remote = self
            .fabric
            .mailbox(target)
            .ok_or_else(|| MessagingError::Unreachable(target.clone()))?;

        if !self.mailbox.is_reachable() || !remote.is_reachable() {
            return Err(MessagingError::Unreachable(target.clone()));
        }

        let handler = remote
            .handlers
            .get(&subject)
            .map(|h| h.clone())
            .ok_or_else(|| MessagingError::NoHandler {
                target: target.clone(),
                subject,
            })?;

        let delay = Duration::from_millis(remote.delay_ms.load(Ordering::SeqCst));
        let sender = self.local.clone();

        // Inbound handling runs on its own task, like a remote responder pool
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            handler.handle(&sender, &payload).await
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(MessagingError::Handler(join_error.to_string())),
            Err(_) => {
                warn!(
                    target = %target,
                    subject = %subject,
                    "Request timed out after {:?}",
                    timeout
                );
                Err(MessagingError::Timeout {
                    target: target.clone(),
                    subject,
                    after: timeout,
                })
            }
        }
    }

    fn subscribe(&self, subject: MessageSubject, handler: Arc<dyn ClusterMessageHandler>) {
        self.mailbox.handlers.insert(subject, handler);
        debug!(node = %self.local, subject = %subject, "Registered message handler");
    }

    fn unsubscribe(&self, subject: MessageSubject) {
        self.mailbox.handlers.remove(&subject);
        debug!(node = %self.local, subject = %subject, "Removed message handler");
    }
}

//! Common test utilities for multi-node store tests
//!
//! - TestCluster: several stores sharing one mastership table and one
//!   in-process transport
//! - TestDelegate: records staged batches and optionally completes them

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use flowstore_api::{CompletedBatchOperation, FlowRule, FlowRuleBatchRequest};
use flowstore_common::{ApplicationId, DeviceId, NodeId};
use flowstore_core::{LocalClusterFabric, MastershipResolver, MastershipTable};
use flowstore_store::{FlowRuleStore, FlowRuleStoreDelegate, FlowStoreConfig};

/// Delegate that records every request and can complete it right away
pub struct TestDelegate {
    store: Weak<FlowRuleStore>,
    auto_complete: AtomicBool,
    requests: Mutex<Vec<FlowRuleBatchRequest>>,
}

impl TestDelegate {
    pub fn new(store: &Arc<FlowRuleStore>) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::downgrade(store),
            auto_complete: AtomicBool::new(false),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<FlowRuleBatchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl FlowRuleStoreDelegate for TestDelegate {
    async fn batch_requested(&self, request: FlowRuleBatchRequest) {
        self.requests.lock().push(request.clone());
        if self.auto_complete.load(Ordering::SeqCst)
            && let Some(store) = self.store.upgrade()
        {
            store.batch_operation_complete(request.batch_id, CompletedBatchOperation::succeeded());
        }
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub resolver: Arc<MastershipResolver>,
    pub store: Arc<FlowRuleStore>,
    pub delegate: Arc<TestDelegate>,
}

pub struct TestCluster {
    pub mastership: Arc<MastershipTable>,
    pub fabric: Arc<LocalClusterFabric>,
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Start `size` nodes named n1, n2, ...
    pub fn start(size: usize, config: FlowStoreConfig) -> Self {
        Self::start_with_resolver_queue(size, config, 256)
    }

    /// Start `size` nodes whose resolvers buffer at most `queue_size` events
    /// per subscriber
    pub fn start_with_resolver_queue(
        size: usize,
        config: FlowStoreConfig,
        queue_size: usize,
    ) -> Self {
        let mastership = Arc::new(MastershipTable::default());
        let fabric = LocalClusterFabric::new();

        let nodes = (1..=size)
            .map(|i| {
                let id = NodeId::new(format!("n{i}"));
                let messenger = fabric.join(id.clone());
                let resolver = Arc::new(MastershipResolver::new(mastership.clone(), queue_size));
                resolver.start();

                let store = FlowRuleStore::new(config.clone(), resolver.clone(), messenger);
                let delegate = TestDelegate::new(&store);
                store.set_delegate(delegate.clone());
                store.start();

                TestNode {
                    id,
                    resolver,
                    store,
                    delegate,
                }
            })
            .collect();

        Self {
            mastership,
            fabric,
            nodes,
        }
    }

    pub fn node(&self, index: usize) -> &TestNode {
        &self.nodes[index]
    }

    /// Make every node complete its batches right away
    pub fn auto_complete(&self) {
        for node in &self.nodes {
            node.delegate.set_auto_complete(true);
        }
    }

    pub fn assign(&self, device: &str, master: usize, backups: &[usize]) {
        self.mastership.set_master(
            &DeviceId::new(device),
            self.nodes[master].id.clone(),
            backups.iter().map(|b| self.nodes[*b].id.clone()).collect(),
        );
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.store.stop().await;
            node.resolver.stop().await;
        }
    }
}

pub fn rule(device: &str, priority: u32) -> FlowRule {
    FlowRule::builder(DeviceId::new(device), ApplicationId::new(7, "org.test.app"))
        .payload(format!("in_port={priority},actions=output:1").into_bytes())
        .priority(priority)
        .build()
}

pub fn fast_config() -> FlowStoreConfig {
    FlowStoreConfig {
        completion_timeout: Duration::from_secs(5),
        lookup_timeout: Duration::from_millis(500),
        batch_forward_timeout: Duration::from_secs(2),
        ..FlowStoreConfig::default()
    }
}

/// Poll `condition` until it holds or two seconds pass
pub async fn eventually<F>(condition: F) -> bool
where
    F: Fn() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await a future with a two second bound
pub async fn bounded<T>(future: impl Future<Output = T>) -> T {
    match tokio::time::timeout(Duration::from_secs(2), future).await {
        Ok(value) => value,
        Err(_) => panic!("operation did not finish in time"),
    }
}

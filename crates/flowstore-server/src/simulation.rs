// In-process cluster simulation
// Boots several store nodes on one mastership table and one transport, then
// drives batches through them with a delegate that installs rules locally

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, ensure};
use chrono::{DateTime, Local};
use futures::future::join_all;
use rand::Rng;
use tracing::{debug, info, warn};

use flowstore_api::{
    CompletedBatchOperation, FlowEntryState, FlowRule, FlowRuleBatch, FlowRuleBatchRequest,
};
use flowstore_common::{ApplicationId, DeviceId, NodeId};
use flowstore_core::{Configuration, LocalClusterFabric, MastershipResolver, MastershipTable};
use flowstore_store::{FlowRuleStore, FlowRuleStoreDelegate, FlowStoreConfig};

const SIMULATION_APP: &str = "org.flowstore.simulation";
const MASTERSHIP_QUEUE_SIZE: usize = 1024;

#[derive(Clone, Debug)]
pub struct SimulationConfig {
    pub nodes: usize,
    pub devices: usize,
    pub batches: usize,
    pub rules_per_batch: usize,
    /// Fraction of rules the loopback delegate reports as failed
    pub failure_rate: f64,
    pub install_delay: Duration,
    pub store: FlowStoreConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self::from_configuration(&Configuration::default())
    }
}

impl SimulationConfig {
    pub fn from_configuration(configuration: &Configuration) -> Self {
        Self {
            nodes: configuration.simulation_nodes(),
            devices: configuration.simulation_devices(),
            batches: configuration.simulation_batches(),
            rules_per_batch: configuration.simulation_rules_per_batch(),
            failure_rate: configuration.simulation_failure_rate(),
            install_delay: Duration::from_millis(configuration.simulation_install_delay_ms()),
            store: FlowStoreConfig::from_configuration(configuration),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.nodes > 0, "simulation needs at least one node");
        ensure!(self.devices > 0, "simulation needs at least one device");
        ensure!(
            self.rules_per_batch > 0,
            "simulation needs at least one rule per batch"
        );
        ensure!(
            (0.0..=1.0).contains(&self.failure_rate),
            "failure rate must be between 0 and 1, got {}",
            self.failure_rate
        );
        Ok(())
    }
}

/// Delegate that "installs" staged batches after a delay and reports back
pub struct LoopbackDelegate {
    store: Weak<FlowRuleStore>,
    failure_rate: f64,
    install_delay: Duration,
    installed: AtomicUsize,
    failed: AtomicUsize,
}

impl LoopbackDelegate {
    pub fn new(store: &Arc<FlowRuleStore>, failure_rate: f64, install_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            store: Arc::downgrade(store),
            failure_rate,
            install_delay,
            installed: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        })
    }

    pub fn installed(&self) -> usize {
        self.installed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::Relaxed)
    }

    fn pick_failures(&self, request: &FlowRuleBatchRequest) -> HashSet<FlowRule> {
        let mut rng = rand::rng();
        request
            .to_add
            .iter()
            .chain(request.to_remove.iter())
            .filter(|_| rng.random_bool(self.failure_rate))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl FlowRuleStoreDelegate for LoopbackDelegate {
    async fn batch_requested(&self, request: FlowRuleBatchRequest) {
        let failed = self.pick_failures(&request);
        let total = request.to_add.len() + request.to_remove.len();
        self.installed.fetch_add(total - failed.len(), Ordering::Relaxed);
        self.failed.fetch_add(failed.len(), Ordering::Relaxed);

        let store = self.store.clone();
        let delay = self.install_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(store) = store.upgrade() else {
                return;
            };
            debug!(
                batch_id = %request.batch_id,
                device_id = %request.device_id,
                failed = failed.len(),
                "Loopback install finished"
            );
            let result = if failed.is_empty() {
                CompletedBatchOperation::succeeded()
            } else {
                CompletedBatchOperation::failed(failed)
            };
            store.batch_operation_complete(request.batch_id, result);
        });
    }
}

pub struct SimulationNode {
    pub id: NodeId,
    pub resolver: Arc<MastershipResolver>,
    pub store: Arc<FlowRuleStore>,
    pub delegate: Arc<LoopbackDelegate>,
}

#[derive(Clone, Debug)]
pub struct SimulationReport {
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub submitted: usize,
    pub succeeded: usize,
    pub partially_failed: usize,
    pub errored: usize,
    pub failed_rules: usize,
    /// Entries held by device masters when the run ended
    pub stored_rules: usize,
    pub added_rules: usize,
    pub failed_entries: usize,
}

impl fmt::Display for SimulationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "started {} and took {:?}: {} batches submitted, {} succeeded, {} partially failed, \
             {} errored, {} rules failed; {} entries stored ({} added, {} failed)",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.elapsed,
            self.submitted,
            self.succeeded,
            self.partially_failed,
            self.errored,
            self.failed_rules,
            self.stored_rules,
            self.added_rules,
            self.failed_entries
        )
    }
}

pub struct Simulation {
    config: SimulationConfig,
    mastership: Arc<MastershipTable>,
    fabric: Arc<LocalClusterFabric>,
    nodes: Vec<SimulationNode>,
    devices: Vec<DeviceId>,
}

impl Simulation {
    /// Boot every node and assign devices round-robin, next node as backup
    pub fn start(config: SimulationConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let mastership = Arc::new(MastershipTable::new(MASTERSHIP_QUEUE_SIZE));
        let fabric = LocalClusterFabric::new();

        let nodes: Vec<SimulationNode> = (1..=config.nodes)
            .map(|i| {
                let id = NodeId::new(format!("node-{i}"));
                let messenger = fabric.join(id.clone());
                let resolver = Arc::new(MastershipResolver::new(
                    mastership.clone(),
                    MASTERSHIP_QUEUE_SIZE,
                ));
                resolver.start();

                let store = FlowRuleStore::new(config.store.clone(), resolver.clone(), messenger);
                let delegate =
                    LoopbackDelegate::new(&store, config.failure_rate, config.install_delay);
                store.set_delegate(delegate.clone());
                store.start();

                SimulationNode {
                    id,
                    resolver,
                    store,
                    delegate,
                }
            })
            .collect();

        let devices: Vec<DeviceId> = (1..=config.devices)
            .map(|i| DeviceId::new(format!("of:{i:016x}")))
            .collect();

        for (index, device_id) in devices.iter().enumerate() {
            let master = nodes[index % nodes.len()].id.clone();
            let backups = if nodes.len() > 1 {
                vec![nodes[(index + 1) % nodes.len()].id.clone()]
            } else {
                Vec::new()
            };
            mastership.set_master(device_id, master, backups);
        }

        info!(
            nodes = nodes.len(),
            devices = devices.len(),
            "Simulation cluster started"
        );

        Ok(Self {
            config,
            mastership,
            fabric,
            nodes,
            devices,
        })
    }

    pub fn nodes(&self) -> &[SimulationNode] {
        &self.nodes
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn mastership(&self) -> &Arc<MastershipTable> {
        &self.mastership
    }

    /// Submit every batch and collect the outcome
    ///
    /// Batches go out in rounds of one per device. From the second round on
    /// each batch also removes the first rule its device got a round earlier.
    pub async fn run(&self) -> anyhow::Result<SimulationReport> {
        let started_at = Local::now();
        let started = Instant::now();
        let mut report = SimulationReport {
            started_at,
            elapsed: Duration::ZERO,
            submitted: 0,
            succeeded: 0,
            partially_failed: 0,
            errored: 0,
            failed_rules: 0,
            stored_rules: 0,
            added_rules: 0,
            failed_entries: 0,
        };

        let device_count = self.devices.len();
        let mut index = 0;
        while index < self.config.batches {
            let round_end = (index + device_count).min(self.config.batches);
            let submissions = (index..round_end).map(|i| self.submit(i));
            for outcome in join_all(submissions).await {
                report.submitted += 1;
                match outcome {
                    Ok(result) if result.success => report.succeeded += 1,
                    Ok(result) => {
                        report.partially_failed += 1;
                        report.failed_rules += result.failed_rules.len();
                    }
                    Err(e) => {
                        warn!("Batch did not complete: {:#}", e);
                        report.errored += 1;
                    }
                }
            }
            index = round_end;
        }

        let reader = &self.nodes[0].store;
        for device_id in &self.devices {
            let entries = reader
                .get_flow_entries(device_id)
                .await
                .with_context(|| format!("reading table of {}", device_id))?;
            report.stored_rules += entries.len();
            report.added_rules += entries
                .iter()
                .filter(|e| e.state() == FlowEntryState::Added)
                .count();
            report.failed_entries += entries
                .iter()
                .filter(|e| e.state() == FlowEntryState::Failed)
                .count();
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    async fn submit(&self, index: usize) -> anyhow::Result<CompletedBatchOperation> {
        let device_count = self.devices.len();
        let device_id = &self.devices[index % device_count];
        let node_index = rand::rng().random_range(0..self.nodes.len());
        let node = &self.nodes[node_index];

        let mut batch = FlowRuleBatch::default();
        for offset in 0..self.config.rules_per_batch {
            batch = batch.add(self.rule(device_id, index * self.config.rules_per_batch + offset));
        }
        if index >= device_count {
            let previous = (index - device_count) * self.config.rules_per_batch;
            batch = batch.remove(self.rule(device_id, previous));
        }

        debug!(
            device_id = %device_id,
            node = %node.id,
            operations = batch.len(),
            "Submitting simulated batch"
        );
        let handle = node.store.store_batch(batch).await?;
        Ok(handle.await?)
    }

    fn rule(&self, device_id: &DeviceId, sequence: usize) -> FlowRule {
        FlowRule::builder(device_id.clone(), ApplicationId::new(1, SIMULATION_APP))
            .payload(format!("in_port={},actions=output:{}", sequence, sequence % 16).into_bytes())
            .priority(sequence as u32)
            .build()
    }

    /// Stop every store, then every resolver, then leave the transport
    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.store.stop().await;
        }
        for node in &self.nodes {
            node.resolver.stop().await;
            self.fabric.leave(&node.id);
        }
        info!("Simulation cluster stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim_config(nodes: usize, devices: usize, batches: usize, failure_rate: f64) -> SimulationConfig {
        SimulationConfig {
            nodes,
            devices,
            batches,
            rules_per_batch: 3,
            failure_rate,
            install_delay: Duration::from_millis(1),
            store: FlowStoreConfig {
                completion_timeout: Duration::from_secs(5),
                lookup_timeout: Duration::from_secs(1),
                batch_forward_timeout: Duration::from_secs(5),
                ..FlowStoreConfig::default()
            },
        }
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(sim_config(0, 1, 1, 0.0).validate().is_err());
        assert!(sim_config(1, 0, 1, 0.0).validate().is_err());
        assert!(sim_config(1, 1, 1, 1.5).validate().is_err());
        assert!(sim_config(1, 1, 1, 0.5).validate().is_ok());
    }

    #[test]
    fn test_from_configuration() {
        let configuration = Configuration::from_config(
            config::Config::builder()
                .set_default("flowstore.simulation.nodes", 5)
                .unwrap()
                .set_default("flowstore.simulation.failure-rate", 0.25)
                .unwrap()
                .build()
                .unwrap(),
        );
        let config = SimulationConfig::from_configuration(&configuration);
        assert_eq!(config.nodes, 5);
        assert_eq!(config.devices, 6);
        assert_eq!(config.failure_rate, 0.25);
    }

    #[tokio::test]
    async fn test_devices_assigned_round_robin() {
        let simulation = Simulation::start(sim_config(3, 3, 0, 0.0)).unwrap();

        for (index, device_id) in simulation.devices().iter().enumerate() {
            let replica = simulation.nodes()[0].store.replica_info(device_id);
            assert_eq!(replica.master.as_ref(), Some(&simulation.nodes()[index].id));
            assert_eq!(replica.backups, vec![simulation.nodes()[(index + 1) % 3].id.clone()]);
        }

        simulation.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_without_failures() {
        let simulation = Simulation::start(sim_config(2, 2, 4, 0.0)).unwrap();
        let report = simulation.run().await.unwrap();

        assert_eq!(report.submitted, 4);
        assert_eq!(report.succeeded, 4);
        assert_eq!(report.partially_failed, 0);
        assert_eq!(report.errored, 0);
        // Four batches of three adds, minus one removal per device in round two
        assert_eq!(report.stored_rules, 10);
        assert_eq!(report.added_rules, 10);

        let installed: usize = simulation
            .nodes()
            .iter()
            .map(|n| n.delegate.installed())
            .sum();
        assert_eq!(installed, 14);

        simulation.shutdown().await;
    }

    #[tokio::test]
    async fn test_run_with_every_rule_failing() {
        let simulation = Simulation::start(sim_config(2, 2, 2, 1.0)).unwrap();
        let report = simulation.run().await.unwrap();

        assert_eq!(report.partially_failed, 2);
        assert_eq!(report.failed_rules, 6);
        assert_eq!(report.failed_entries, 6);
        assert_eq!(report.added_rules, 0);

        simulation.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_store() {
        let simulation = Simulation::start(sim_config(2, 1, 0, 0.0)).unwrap();
        simulation.shutdown().await;

        for node in simulation.nodes() {
            assert!(!node.store.is_running());
        }
    }
}

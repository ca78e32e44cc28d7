//! Distributed flow rule store
//!
//! Entry point for batch mutations and lookups. Every operation is routed by
//! device mastership: the master applies it to its own [`FlowTable`], every
//! other node forwards it to the master through the cluster messenger.
//!
//! Local batches are staged on the table and handed to the
//! [`FlowRuleStoreDelegate`], which reports the real outcome later through
//! [`FlowRuleStore::batch_operation_complete`].

use std::{
    collections::HashSet,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowstore_api::{
    BatchOperation, CompletedBatchOperation, FlowEntry, FlowEntryState, FlowRule, FlowRuleBatch,
    FlowRuleBatchRequest, FlowRuleEvent, FlowRuleEventType, FlowRuleOperation, MessageSubject,
    ReplicaInfo,
    remote::model::{
        ApplyBatchRequest, GetDeviceEntriesRequest, GetEntryRequest, UpdateBackupRequest,
    },
};
use flowstore_common::{BatchId, DeviceId, FlowStoreError, NodeId, Result};
use flowstore_core::{
    ClusterMessenger, MastershipEventType, MastershipResolver, ReplicaInfoEvent,
    TypedMessageHandler, send_request,
};

use crate::{
    backup::{BackupTable, BackupWorker},
    completion::{BatchFuture, CompletionRegistry, StagedBatch},
    config::FlowStoreConfig,
    delegate::FlowRuleStoreDelegate,
    event::{EventDispatcher, FlowStoreEvent},
    handler::{ApplyBatchHandler, GetDeviceEntriesHandler, GetEntryHandler, UpdateBackupHandler},
    metrics,
    table::{DeviceShard, FlowTable, UpdateOutcome},
};

#[derive(Default)]
struct Workers {
    sweeper: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
}

/// Mastership-routed flow rule store of one cluster node
pub struct FlowRuleStore {
    local_node: NodeId,
    config: FlowStoreConfig,
    resolver: Arc<MastershipResolver>,
    messenger: Arc<dyn ClusterMessenger>,
    table: FlowTable,
    backups: BackupTable,
    completions: Arc<CompletionRegistry>,
    events: EventDispatcher,
    delegate: RwLock<Option<Arc<dyn FlowRuleStoreDelegate>>>,
    backup_worker: BackupWorker,
    next_batch_id: AtomicU64,
    running: AtomicBool,
    workers: Mutex<Workers>,
    self_ref: Weak<FlowRuleStore>,
}

impl FlowRuleStore {
    pub fn new(
        config: FlowStoreConfig,
        resolver: Arc<MastershipResolver>,
        messenger: Arc<dyn ClusterMessenger>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            local_node: messenger.local_node().clone(),
            completions: Arc::new(CompletionRegistry::new(config.completion_timeout)),
            events: EventDispatcher::new(config.event_queue_size),
            backup_worker: BackupWorker::new(config.backup_queue_size),
            config,
            resolver,
            messenger,
            table: FlowTable::new(),
            backups: BackupTable::new(),
            delegate: RwLock::new(None),
            next_batch_id: AtomicU64::new(1),
            running: AtomicBool::new(false),
            workers: Mutex::new(Workers::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub fn config(&self) -> &FlowStoreConfig {
        &self.config
    }

    /// Attach the delegate that realizes staged batches
    pub fn set_delegate(&self, delegate: Arc<dyn FlowRuleStoreDelegate>) {
        *self.delegate.write() = Some(delegate);
    }

    pub fn unset_delegate(&self) {
        *self.delegate.write() = None;
    }

    /// Subscribe to store events
    ///
    /// Each subscriber gets a bounded queue of `event-queue-size` events; on
    /// overflow the oldest events are dropped for that subscriber only.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowStoreEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register message handlers and start background workers
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        self.register_handlers();
        workers.sweeper = Some(
            self.completions
                .start_sweeper(self.config.completion_sweep_interval),
        );
        if self.config.backup_enabled {
            self.backup_worker.start(
                self.messenger.clone(),
                self.resolver.clone(),
                self.config.lookup_timeout,
            );
        }
        workers.listener = Some(self.start_mastership_listener());

        info!(node = %self.local_node, "Started flow rule store");
    }

    /// Stop background workers in reverse start order
    ///
    /// Every still pending completion handle fails with
    /// [`FlowStoreError::CompletionDropped`].
    pub async fn stop(&self) {
        let (listener, sweeper) = {
            let mut workers = self.workers.lock();
            if !self.running.swap(false, Ordering::SeqCst) {
                return;
            }
            (workers.listener.take(), workers.sweeper.take())
        };

        if let Some(listener) = listener {
            listener.abort();
            let _ = listener.await;
        }
        self.backup_worker.stop().await;
        if let Some(sweeper) = sweeper {
            sweeper.abort();
            let _ = sweeper.await;
        }
        self.unregister_handlers();

        let dropped = self.completions.fail_all();
        if dropped > 0 {
            warn!(count = dropped, "Dropped pending completions on shutdown");
        }
        info!(node = %self.local_node, "Stopped flow rule store");
    }

    // ===================== Mutations =====================

    /// Submit a batch for its device's master to apply
    ///
    /// Resolves right away for an empty batch or a batch with nothing new to
    /// stage. A forwarded batch resolves with the master's result. Routing
    /// and timeout failures of the forward are returned as errors; they are
    /// never retried.
    pub async fn store_batch(&self, batch: FlowRuleBatch) -> Result<BatchFuture> {
        metrics::record_batch_submitted();

        let Some(device_id) = batch.device_id().cloned() else {
            return Ok(BatchFuture::ready(Ok(CompletedBatchOperation::succeeded())));
        };
        if !self.is_running() {
            return Err(FlowStoreError::Stopped);
        }
        if batch.spans_multiple_devices() {
            warn!(
                device_id = %device_id,
                "Batch targets more than one device, routing it by its first operation"
            );
        }

        match self.resolver.replica_info(&device_id).master {
            None => {
                warn!(device_id = %device_id, "No master for device, rejecting batch");
                Err(FlowStoreError::routing(&device_id, "device has no master"))
            }
            Some(master) if master == self.local_node => self.apply_batch_locally(batch).await,
            Some(master) => self.forward_batch(&master, &device_id, batch).await,
        }
    }

    /// Store a single rule
    pub async fn store_flow_rule(&self, rule: FlowRule) -> Result<BatchFuture> {
        self.store_batch(FlowRuleBatch::default().add(rule)).await
    }

    /// Delete a single rule
    pub async fn delete_flow_rule(&self, rule: FlowRule) -> Result<BatchFuture> {
        self.store_batch(FlowRuleBatch::default().remove(rule)).await
    }

    async fn forward_batch(
        &self,
        master: &NodeId,
        device_id: &DeviceId,
        batch: FlowRuleBatch,
    ) -> Result<BatchFuture> {
        debug!(
            device_id = %device_id,
            master = %master,
            operations = batch.len(),
            "Forwarding batch to device master"
        );
        metrics::record_batch_forwarded(master.as_str());

        let request = ApplyBatchRequest { batch };
        match send_request(
            self.messenger.as_ref(),
            master,
            &request,
            self.config.batch_forward_timeout,
        )
        .await
        {
            Ok(result) => Ok(BatchFuture::ready(Ok(result))),
            Err(e) => {
                warn!(device_id = %device_id, master = %master, "Forwarded batch failed: {}", e);
                Err(e.into_store_error(device_id))
            }
        }
    }

    /// Stage a batch on the local table and hand it to the delegate
    ///
    /// Callers must be master of the batch's device. Operations targeting
    /// any other device are not staged and come back in `failed_rules`.
    pub async fn apply_batch_locally(&self, batch: FlowRuleBatch) -> Result<BatchFuture> {
        let Some(device_id) = batch.device_id().cloned() else {
            return Ok(BatchFuture::ready(Ok(CompletedBatchOperation::succeeded())));
        };

        let (operations, foreign) = split_by_device(&batch.operations, &device_id);
        if !foreign.is_empty() {
            warn!(
                device_id = %device_id,
                rejected = foreign.len(),
                "Failing batch operations for devices other than the routing device"
            );
        }

        let mut staged = StagedBatch {
            device_id: Some(device_id.clone()),
            ..Default::default()
        };
        self.table.write(&device_id, |shard| {
            stage_operations(shard, &operations, &mut staged);
        });

        if staged.to_add.is_empty() && staged.to_remove.is_empty() {
            debug!(device_id = %device_id, "Nothing to stage, batch completes immediately");
            let result = if foreign.is_empty() {
                CompletedBatchOperation::succeeded()
            } else {
                CompletedBatchOperation::failed(foreign)
            };
            return Ok(BatchFuture::ready(Ok(result)));
        }

        let batch_id = BatchId::new(self.next_batch_id.fetch_add(1, Ordering::SeqCst));
        let request = FlowRuleBatchRequest {
            batch_id,
            device_id: device_id.clone(),
            to_add: staged.to_add.clone(),
            to_remove: staged.to_remove.clone(),
        };
        let handle = self
            .completions
            .register(batch_id, staged)
            .with_failed_rules(foreign);

        // A stop racing with this batch has already failed the registry
        if !self.is_running() {
            drop(self.completions.take(batch_id));
            return Ok(handle);
        }

        self.replicate(&device_id);

        debug!(
            batch_id = %batch_id,
            device_id = %device_id,
            to_add = request.to_add.len(),
            to_remove = request.to_remove.len(),
            "Batch staged"
        );
        self.events
            .publish(FlowStoreEvent::BatchRequested(request.clone()));

        let delegate = self.delegate.read().clone();
        match delegate {
            Some(delegate) => delegate.batch_requested(request).await,
            None => warn!(batch_id = %batch_id, "No delegate attached, batch waits for expiry"),
        }

        Ok(handle)
    }

    /// Report the outcome of a staged batch
    ///
    /// Resolves the waiting handle at most once and reconciles the table;
    /// unknown or expired batch ids are only republished. Never fails.
    pub fn batch_operation_complete(&self, batch_id: BatchId, result: CompletedBatchOperation) {
        match self.completions.take(batch_id) {
            Some(pending) => {
                self.reconcile(pending.staged(), &result);
                pending.complete(result.clone());
                debug!(batch_id = %batch_id, success = result.success, "Batch completed");
            }
            None => {
                debug!(batch_id = %batch_id, "Completion for unknown batch, republishing only");
            }
        }

        self.events
            .publish(FlowStoreEvent::BatchCompleted { batch_id, result });
    }

    fn reconcile(&self, staged: &StagedBatch, result: &CompletedBatchOperation) {
        let mut touched = HashSet::new();

        for rule in &staged.to_add {
            let failed = result.is_failed(rule);
            self.table.modify(rule.device_id(), |shard| {
                if failed {
                    shard.mark_failed(rule)
                } else {
                    shard.confirm_added(rule)
                }
            });
            touched.insert(rule.device_id().clone());
        }

        for rule in &staged.to_remove {
            let failed = result.is_failed(rule);
            self.table.modify(rule.device_id(), |shard| {
                if failed {
                    shard.revert_removal(rule)
                } else {
                    shard.confirm_removed(rule)
                }
            });
            touched.insert(rule.device_id().clone());
        }

        for device_id in &touched {
            self.replicate(device_id);
        }
    }

    /// Push a rule confirmation or counter update from the delegate
    ///
    /// Only valid on the master; elsewhere the update is logged and dropped.
    pub fn add_or_update_flow_rule(&self, entry: FlowEntry) -> Option<FlowRuleEvent> {
        let device_id = entry.device_id().clone();
        if !self.is_local_master(&device_id) {
            self.reject_mutation("add_or_update", entry.rule());
            return None;
        }

        let outcome = self
            .table
            .write(&device_id, |shard| shard.add_or_update(entry));
        self.replicate(&device_id);

        let event = match outcome {
            UpdateOutcome::Added(stored) => FlowRuleEvent::new(FlowRuleEventType::RuleAdded, stored),
            UpdateOutcome::Updated(stored) => {
                FlowRuleEvent::new(FlowRuleEventType::RuleUpdated, stored)
            }
            UpdateOutcome::Inserted => return None,
        };
        self.events.publish(FlowStoreEvent::Rule(event.clone()));
        Some(event)
    }

    /// Remove a rule reported gone by the delegate
    ///
    /// Only valid on the master; elsewhere the removal is logged and dropped.
    pub fn remove_flow_rule(&self, entry: &FlowEntry) -> Option<FlowRuleEvent> {
        let device_id = entry.device_id();
        if !self.is_local_master(device_id) {
            self.reject_mutation("remove", entry.rule());
            return None;
        }

        let removed = self
            .table
            .modify(device_id, |shard| shard.remove(entry.rule()))
            .flatten();
        self.replicate(device_id);

        let mut removed = removed?;
        removed.set_state(FlowEntryState::Removed);
        let event = FlowRuleEvent::new(FlowRuleEventType::RuleRemoved, removed);
        self.events.publish(FlowStoreEvent::Rule(event.clone()));
        Some(event)
    }

    fn reject_mutation(&self, operation: &'static str, rule: &FlowRule) {
        let err = FlowStoreError::RejectedMutation {
            device: rule.device_id().clone(),
            node: self.local_node.clone(),
        };
        error!(operation, priority = rule.priority(), "{}", err);
        metrics::record_rejected_mutation(operation);
    }

    // ===================== Lookups =====================

    /// Entry for a rule, read from the device master
    pub async fn get_flow_entry(&self, rule: &FlowRule) -> Result<Option<FlowEntry>> {
        let device_id = rule.device_id();
        let replica = self.resolver.replica_info(device_id);
        let Some(master) = replica.master else {
            warn!(device_id = %device_id, "No master for device, entry lookup returns nothing");
            return Ok(None);
        };

        if master == self.local_node {
            return Ok(self.table.lookup(rule));
        }
        if self.config.allow_non_master_reads
            && let Some(found) = self.backups.lookup(rule)
        {
            debug!(device_id = %device_id, "Serving entry lookup from backup copy");
            return Ok(found);
        }

        debug!(device_id = %device_id, master = %master, "Forwarding entry lookup");
        let request = GetEntryRequest { rule: rule.clone() };
        send_request(
            self.messenger.as_ref(),
            &master,
            &request,
            self.config.lookup_timeout,
        )
        .await
        .map_err(|e| e.into_store_error(device_id))
    }

    /// Every entry of a device, read from the device master
    pub async fn get_flow_entries(&self, device_id: &DeviceId) -> Result<Vec<FlowEntry>> {
        let replica = self.resolver.replica_info(device_id);
        let Some(master) = replica.master else {
            warn!(device_id = %device_id, "No master for device, table lookup returns nothing");
            return Ok(Vec::new());
        };

        if master == self.local_node {
            return Ok(self.table.snapshot(device_id));
        }
        if self.config.allow_non_master_reads
            && let Some(copy) = self.backups.get(device_id)
        {
            debug!(device_id = %device_id, "Serving table lookup from backup copy");
            return Ok(copy);
        }

        debug!(device_id = %device_id, master = %master, "Forwarding table lookup");
        let request = GetDeviceEntriesRequest {
            device_id: device_id.clone(),
        };
        send_request(
            self.messenger.as_ref(),
            &master,
            &request,
            self.config.lookup_timeout,
        )
        .await
        .map_err(|e| e.into_store_error(device_id))
    }

    /// Number of entries over every device with a known assignment
    pub async fn get_flow_rule_count(&self) -> Result<usize> {
        let mut count = 0;
        for device_id in self.resolver.devices() {
            count += self.get_flow_entries(&device_id).await?.len();
        }
        Ok(count)
    }

    // ===================== Local state =====================

    pub fn is_local_master(&self, device_id: &DeviceId) -> bool {
        self.resolver.is_master(device_id, &self.local_node)
    }

    pub fn replica_info(&self, device_id: &DeviceId) -> ReplicaInfo {
        self.resolver.replica_info(device_id)
    }

    /// Entry in this node's own table, without routing
    pub fn local_entry(&self, rule: &FlowRule) -> Option<FlowEntry> {
        self.table.lookup(rule)
    }

    /// Snapshot of this node's own table for a device, without routing
    pub fn local_entries(&self, device_id: &DeviceId) -> Vec<FlowEntry> {
        self.table.snapshot(device_id)
    }

    /// Backup copy of a device table held by this node
    pub fn backup_entries(&self, device_id: &DeviceId) -> Option<Vec<FlowEntry>> {
        self.backups.get(device_id)
    }

    pub fn pending_completions(&self) -> usize {
        self.completions.len()
    }

    /// Store a backup copy pushed by the device master
    pub(crate) fn accept_backup(&self, sender: &NodeId, request: UpdateBackupRequest) -> bool {
        let replica = self.resolver.replica_info(&request.device_id);
        if !replica.is_master(sender) {
            warn!(
                device_id = %request.device_id,
                sender = %sender,
                "Ignoring backup update from a node that is not master"
            );
            return false;
        }

        debug!(
            device_id = %request.device_id,
            entries = request.entries.len(),
            "Stored backup copy"
        );
        self.backups.update(request.device_id, request.entries);
        true
    }

    fn replicate(&self, device_id: &DeviceId) {
        if !self.config.backup_enabled || !self.backup_worker.is_running() {
            return;
        }
        // Snapshot and enqueue under the device lock so copies leave in mutation order
        self.table.modify(device_id, |shard| {
            self.backup_worker.enqueue(device_id.clone(), shard.entries());
        });
    }

    // ===================== Mastership =====================

    fn start_mastership_listener(&self) -> JoinHandle<()> {
        let mut rx = self.resolver.subscribe();
        let store = self.self_ref.clone();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(store) = store.upgrade() else { break };
                        store.handle_replica_event(&event);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        let Some(store) = store.upgrade() else { break };
                        warn!(skipped, "Mastership events lagged, resynchronizing tables");
                        store.resync_mastership();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    fn handle_replica_event(&self, event: &ReplicaInfoEvent) {
        let device_id = event.device_id();
        let is_master = event.replica_info.is_master(&self.local_node);

        match event.event_type {
            MastershipEventType::MasterChanged if is_master => self.become_master(device_id),
            MastershipEventType::MasterChanged => {
                self.release_device(device_id, &event.replica_info)
            }
            MastershipEventType::BackupsChanged if is_master => self.replicate(device_id),
            MastershipEventType::BackupsChanged => {
                if !event.replica_info.backups.contains(&self.local_node)
                    && self.backups.take(device_id).is_some()
                {
                    debug!(device_id = %device_id, "No longer a backup, dropped backup copy");
                }
            }
        }
    }

    fn become_master(&self, device_id: &DeviceId) {
        match self.backups.take(device_id) {
            Some(entries) => {
                info!(
                    device_id = %device_id,
                    entries = entries.len(),
                    "Became master, loading table from backup copy"
                );
                self.table.load_shard(device_id, entries);
            }
            None => info!(device_id = %device_id, "Became master, no backup copy to load"),
        }
        self.replicate(device_id);
    }

    fn release_device(&self, device_id: &DeviceId, replica: &ReplicaInfo) {
        let Some(entries) = self.table.drop_shard(device_id) else {
            return;
        };
        info!(
            device_id = %device_id,
            entries = entries.len(),
            "No longer master, dropped primary table"
        );

        if replica.backups.contains(&self.local_node) {
            self.backups.update(device_id.clone(), entries);
        } else {
            self.backups.take(device_id);
        }
    }

    fn resync_mastership(&self) {
        for device_id in self.table.devices() {
            if !self.is_local_master(&device_id) {
                let replica = self.resolver.replica_info(&device_id);
                self.release_device(&device_id, &replica);
            }
        }
        for device_id in self.backups.devices() {
            if self.is_local_master(&device_id) {
                self.become_master(&device_id);
            }
        }
    }

    // ===================== Handlers =====================

    fn register_handlers(&self) {
        let store = self.self_ref.clone();
        self.messenger.subscribe(
            MessageSubject::ApplyBatch,
            TypedMessageHandler::<ApplyBatchRequest, _>::shared(ApplyBatchHandler::new(
                store.clone(),
            )),
        );
        self.messenger.subscribe(
            MessageSubject::GetEntry,
            TypedMessageHandler::<GetEntryRequest, _>::shared(GetEntryHandler::new(store.clone())),
        );
        self.messenger.subscribe(
            MessageSubject::GetDeviceEntries,
            TypedMessageHandler::<GetDeviceEntriesRequest, _>::shared(
                GetDeviceEntriesHandler::new(store.clone()),
            ),
        );
        self.messenger.subscribe(
            MessageSubject::UpdateBackup,
            TypedMessageHandler::<UpdateBackupRequest, _>::shared(UpdateBackupHandler::new(store)),
        );
    }

    fn unregister_handlers(&self) {
        for subject in MessageSubject::ALL {
            self.messenger.unsubscribe(subject);
        }
    }
}

/// Operations for `device_id`, plus the targets of every other operation
fn split_by_device<'a>(
    operations: &'a [BatchOperation],
    device_id: &DeviceId,
) -> (Vec<&'a BatchOperation>, HashSet<FlowRule>) {
    let mut local = Vec::new();
    let mut foreign = HashSet::new();
    for op in operations {
        if op.target.device_id() == device_id {
            local.push(op);
        } else {
            foreign.insert(op.target.clone());
        }
    }
    (local, foreign)
}

/// Removes first, then adds; duplicates and absent targets are skipped
fn stage_operations(shard: &mut DeviceShard, operations: &[&BatchOperation], staged: &mut StagedBatch) {
    for op in operations
        .iter()
        .filter(|op| op.operator == FlowRuleOperation::Remove)
    {
        if shard.apply_remove(&op.target).is_some() {
            staged.to_remove.push(op.target.clone());
        }
    }
    for op in operations
        .iter()
        .filter(|op| op.operator == FlowRuleOperation::Add)
    {
        if shard.apply_add(&op.target) {
            staged.to_add.push(op.target.clone());
        }
    }
}

// Inbound cluster message handlers
// Serve requests forwarded by other nodes to this node as device master

use std::sync::Weak;

use tracing::{error, warn};

use flowstore_api::{
    CompletedBatchOperation, FlowEntry,
    remote::model::{
        ApplyBatchRequest, BackupAck, GetDeviceEntriesRequest, GetEntryRequest,
        UpdateBackupRequest,
    },
};
use flowstore_common::NodeId;
use flowstore_core::RequestHandler;

use crate::store::FlowRuleStore;

/// Applies a forwarded batch and replies once the delegate has completed it
pub struct ApplyBatchHandler {
    store: Weak<FlowRuleStore>,
}

impl ApplyBatchHandler {
    pub fn new(store: Weak<FlowRuleStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl RequestHandler<ApplyBatchRequest> for ApplyBatchHandler {
    async fn handle(&self, sender: &NodeId, request: ApplyBatchRequest) -> CompletedBatchOperation {
        let batch = request.batch;
        let Some(device_id) = batch.device_id().cloned() else {
            return CompletedBatchOperation::succeeded();
        };
        let Some(store) = self.store.upgrade() else {
            return CompletedBatchOperation::all_failed(&batch);
        };

        // Mastership may have moved while the request was in flight
        if !store.is_local_master(&device_id) {
            warn!(
                device_id = %device_id,
                sender = %sender,
                "Forwarded batch reached a node that is no longer master, failing all rules"
            );
            return CompletedBatchOperation::all_failed(&batch);
        }

        let handle = match store.apply_batch_locally(batch.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(device_id = %device_id, "Failed to apply forwarded batch: {}", e);
                return CompletedBatchOperation::all_failed(&batch);
            }
        };

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!(device_id = %device_id, "Forwarded batch did not complete: {}", e);
                CompletedBatchOperation::all_failed(&batch)
            }
        }
    }
}

pub struct GetEntryHandler {
    store: Weak<FlowRuleStore>,
}

impl GetEntryHandler {
    pub fn new(store: Weak<FlowRuleStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl RequestHandler<GetEntryRequest> for GetEntryHandler {
    async fn handle(&self, _sender: &NodeId, request: GetEntryRequest) -> Option<FlowEntry> {
        self.store
            .upgrade()
            .and_then(|store| store.local_entry(&request.rule))
    }
}

pub struct GetDeviceEntriesHandler {
    store: Weak<FlowRuleStore>,
}

impl GetDeviceEntriesHandler {
    pub fn new(store: Weak<FlowRuleStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl RequestHandler<GetDeviceEntriesRequest> for GetDeviceEntriesHandler {
    async fn handle(&self, _sender: &NodeId, request: GetDeviceEntriesRequest) -> Vec<FlowEntry> {
        self.store
            .upgrade()
            .map(|store| store.local_entries(&request.device_id))
            .unwrap_or_default()
    }
}

/// Stores device table copies pushed by the device master
pub struct UpdateBackupHandler {
    store: Weak<FlowRuleStore>,
}

impl UpdateBackupHandler {
    pub fn new(store: Weak<FlowRuleStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl RequestHandler<UpdateBackupRequest> for UpdateBackupHandler {
    async fn handle(&self, sender: &NodeId, request: UpdateBackupRequest) -> BackupAck {
        let accepted = self
            .store
            .upgrade()
            .is_some_and(|store| store.accept_backup(sender, request));
        BackupAck { accepted }
    }
}

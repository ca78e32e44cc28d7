// Backup replication
// The master of a device pushes full copies of its table to the device's
// backup nodes through a single ordered worker. Backups keep the latest
// copy so a new master can pick up where the old one stopped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use flowstore_api::{FlowEntry, FlowRule, remote::model::UpdateBackupRequest};
use flowstore_common::DeviceId;
use flowstore_core::{ClusterMessenger, MastershipResolver, send_request};

/// Device table copies held by this node as a backup
#[derive(Default)]
pub struct BackupTable {
    copies: DashMap<DeviceId, Vec<FlowEntry>>,
}

impl BackupTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the copy of a device table
    pub fn update(&self, device_id: DeviceId, entries: Vec<FlowEntry>) {
        self.copies.insert(device_id, entries);
    }

    pub fn get(&self, device_id: &DeviceId) -> Option<Vec<FlowEntry>> {
        self.copies.get(device_id).map(|c| c.value().clone())
    }

    /// Entry for a rule, if this node holds a copy of its device
    ///
    /// The outer `None` means no copy is held at all.
    pub fn lookup(&self, rule: &FlowRule) -> Option<Option<FlowEntry>> {
        self.copies
            .get(rule.device_id())
            .map(|copy| copy.iter().find(|e| e.rule() == rule).cloned())
    }

    pub fn take(&self, device_id: &DeviceId) -> Option<Vec<FlowEntry>> {
        self.copies.remove(device_id).map(|(_, entries)| entries)
    }

    pub fn contains(&self, device_id: &DeviceId) -> bool {
        self.copies.contains_key(device_id)
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.copies.iter().map(|e| e.key().clone()).collect()
    }
}

struct BackupTask {
    device_id: DeviceId,
    entries: Vec<FlowEntry>,
}

/// Single background worker pushing table copies in enqueue order
pub struct BackupWorker {
    queue_size: usize,
    sender: Mutex<Option<mpsc::Sender<BackupTask>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl BackupWorker {
    pub fn new(queue_size: usize) -> Self {
        Self {
            queue_size: queue_size.max(1),
            sender: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    pub fn start(
        &self,
        messenger: Arc<dyn ClusterMessenger>,
        resolver: Arc<MastershipResolver>,
        timeout: Duration,
    ) {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<BackupTask>(self.queue_size);
        *sender = Some(tx);

        let handle = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                push_backup(messenger.as_ref(), &resolver, task, timeout).await;
            }
            debug!("Backup queue closed");
        });
        *self.task.lock() = Some(handle);

        info!("Started backup worker");
    }

    /// Queue a device table copy; dropped with a warning if the queue is full
    pub fn enqueue(&self, device_id: DeviceId, entries: Vec<FlowEntry>) {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return;
        };

        match tx.try_send(BackupTask { device_id, entries }) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                warn!(device_id = %task.device_id, "Backup queue is full, dropping update");
            }
            Err(TrySendError::Closed(task)) => {
                debug!(device_id = %task.device_id, "Backup worker stopped, dropping update");
            }
        }
    }

    /// Stop accepting updates and wait for queued ones to be pushed
    pub async fn stop(&self) {
        // Dropping the sender lets the worker drain the queue and exit
        drop(self.sender.lock().take());
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Backup worker failed: {}", e);
            }
            info!("Stopped backup worker");
        }
    }
}

async fn push_backup(
    messenger: &dyn ClusterMessenger,
    resolver: &MastershipResolver,
    task: BackupTask,
    timeout: Duration,
) {
    let local = messenger.local_node().clone();
    let replica = resolver.replica_info(&task.device_id);

    // Mastership may have moved since the update was queued
    if !replica.is_master(&local) {
        debug!(
            device_id = %task.device_id,
            "No longer master, skipping backup update"
        );
        return;
    }

    let request = UpdateBackupRequest {
        device_id: task.device_id,
        entries: task.entries,
    };

    for backup in replica.backups.iter().filter(|b| **b != local) {
        match send_request(messenger, backup, &request, timeout).await {
            Ok(ack) if ack.accepted => {
                debug!(
                    device_id = %request.device_id,
                    backup = %backup,
                    entries = request.entries.len(),
                    "Updated backup copy"
                );
            }
            Ok(_) => {
                warn!(
                    device_id = %request.device_id,
                    backup = %backup,
                    "Backup node rejected the update"
                );
            }
            Err(e) => {
                error!(
                    device_id = %request.device_id,
                    backup = %backup,
                    "Failed to update backup: {}",
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowstore_api::FlowEntryState;
    use flowstore_common::ApplicationId;

    fn entry(device: &str, priority: u32) -> FlowEntry {
        let rule = FlowRule::builder(DeviceId::new(device), ApplicationId::new(1, "test"))
            .priority(priority)
            .build();
        FlowEntry::with_state(rule, FlowEntryState::Added)
    }

    #[test]
    fn test_backup_table_lookup() {
        let table = BackupTable::new();
        let device = DeviceId::new("of:1");
        let e1 = entry("of:1", 10);

        assert!(table.lookup(e1.rule()).is_none());

        table.update(device.clone(), vec![e1.clone()]);
        assert_eq!(table.lookup(e1.rule()), Some(Some(e1.clone())));
        assert_eq!(table.lookup(entry("of:1", 20).rule()), Some(None));

        assert_eq!(table.take(&device).map(|c| c.len()), Some(1));
        assert!(!table.contains(&device));
    }

    #[test]
    fn test_enqueue_before_start_is_ignored() {
        let worker = BackupWorker::new(4);
        assert!(!worker.is_running());
        worker.enqueue(DeviceId::new("of:1"), vec![]);
    }
}

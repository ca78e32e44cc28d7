// Replica info resolution
// Translates the mastership feed into ReplicaInfo lookups and change events

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flowstore_api::ReplicaInfo;
use flowstore_common::{DeviceId, NodeId};

use super::mastership::{MastershipEventType, MastershipSource};

/// Replica info change event
#[derive(Clone, Debug)]
pub struct ReplicaInfoEvent {
    pub event_type: MastershipEventType,
    pub replica_info: ReplicaInfo,
}

impl ReplicaInfoEvent {
    pub fn device_id(&self) -> &DeviceId {
        &self.replica_info.device_id
    }
}

/// Read-only view of device mastership for the local node
///
/// No caching: every lookup goes to the underlying source, and no retries
/// are made on its behalf.
pub struct MastershipResolver {
    source: Arc<dyn MastershipSource>,
    events: broadcast::Sender<ReplicaInfoEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MastershipResolver {
    pub fn new(source: Arc<dyn MastershipSource>, queue_size: usize) -> Self {
        let (events, _) = broadcast::channel(queue_size);
        Self {
            source,
            events,
            task: Mutex::new(None),
        }
    }

    /// Current master and backups of a device; the master is absent if unknown
    pub fn replica_info(&self, device_id: &DeviceId) -> ReplicaInfo {
        ReplicaInfo::new(
            device_id.clone(),
            self.source.master_for(device_id),
            self.source.backups_for(device_id),
        )
    }

    pub fn is_master(&self, device_id: &DeviceId, node: &NodeId) -> bool {
        self.source.master_for(device_id).as_ref() == Some(node)
    }

    /// Every device with a known assignment
    pub fn devices(&self) -> Vec<DeviceId> {
        self.source.devices()
    }

    /// Subscribe to replica info changes
    ///
    /// Each subscriber has a bounded queue; a subscriber that falls behind
    /// loses the oldest events and observes `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaInfoEvent> {
        self.events.subscribe()
    }

    /// Start translating mastership events
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }

        let mut rx = self.source.subscribe();
        let source = self.source.clone();
        let events = self.events.clone();

        *task = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let replica_info =
                            ReplicaInfo::new(event.device_id, event.master, event.backups);
                        debug!(
                            device_id = %replica_info.device_id,
                            "Re-emitting {} as replica info event",
                            event.event_type
                        );
                        let _ = events.send(ReplicaInfoEvent {
                            event_type: event.event_type,
                            replica_info,
                        });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Missed changes are unknown, so resend the current view of every device
                        warn!(skipped, "Mastership feed lagged, re-emitting all devices");
                        for device_id in source.devices() {
                            let replica_info = ReplicaInfo::new(
                                device_id.clone(),
                                source.master_for(&device_id),
                                source.backups_for(&device_id),
                            );
                            let _ = events.send(ReplicaInfoEvent {
                                event_type: MastershipEventType::MasterChanged,
                                replica_info,
                            });
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }));

        info!("Started mastership resolver");
    }

    /// Stop translating mastership events
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            info!("Stopped mastership resolver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::mastership::MastershipTable;

    #[test]
    fn test_replica_info_reads_source() {
        let table = Arc::new(MastershipTable::default());
        let resolver = MastershipResolver::new(table.clone(), 16);
        let device = DeviceId::new("of:1");

        let info = resolver.replica_info(&device);
        assert!(info.master.is_none());

        table.set_master(&device, NodeId::new("n1"), vec![NodeId::new("n2")]);
        let info = resolver.replica_info(&device);
        assert_eq!(info.master, Some(NodeId::new("n1")));
        assert_eq!(info.backups, vec![NodeId::new("n2")]);
        assert!(resolver.is_master(&device, &NodeId::new("n1")));
        assert!(!resolver.is_master(&device, &NodeId::new("n2")));
    }

    #[tokio::test]
    async fn test_resolver_re_emits_changes() {
        let table = Arc::new(MastershipTable::default());
        let resolver = MastershipResolver::new(table.clone(), 16);
        resolver.start();
        let mut rx = resolver.subscribe();

        let device = DeviceId::new("of:1");
        table.set_master(&device, NodeId::new("n1"), vec![]);

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, MastershipEventType::MasterChanged);
        assert_eq!(event.device_id(), &device);
        assert!(event.replica_info.is_master(&NodeId::new("n1")));

        resolver.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let table = Arc::new(MastershipTable::default());
        let resolver = MastershipResolver::new(table, 16);
        resolver.start();
        resolver.start();
        resolver.stop().await;
        resolver.stop().await;
    }
}

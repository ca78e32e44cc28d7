// Device mastership feed
// The election algorithm lives elsewhere; this module only models its output:
// a device -> master assignment with ordered backups and change notifications.

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info};

use flowstore_common::{DeviceId, NodeId};

/// Type of mastership change
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MastershipEventType {
    /// The master of the device changed (including to or from no master)
    MasterChanged,
    /// Only the backup list changed
    BackupsChanged,
}

impl std::fmt::Display for MastershipEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MastershipEventType::MasterChanged => write!(f, "MASTER_CHANGED"),
            MastershipEventType::BackupsChanged => write!(f, "BACKUPS_CHANGED"),
        }
    }
}

/// Mastership change notification
#[derive(Clone, Debug)]
pub struct MastershipEvent {
    pub event_type: MastershipEventType,
    pub device_id: DeviceId,
    pub master: Option<NodeId>,
    pub backups: Vec<NodeId>,
}

/// External source of device mastership
pub trait MastershipSource: Send + Sync {
    /// Current master of the device, if any
    fn master_for(&self, device_id: &DeviceId) -> Option<NodeId>;

    /// Ordered backup nodes of the device
    fn backups_for(&self, device_id: &DeviceId) -> Vec<NodeId>;

    /// Every device with a known assignment
    fn devices(&self) -> Vec<DeviceId>;

    /// Subscribe to mastership changes
    fn subscribe(&self) -> broadcast::Receiver<MastershipEvent>;
}

#[derive(Clone, Debug, Default)]
struct Assignment {
    master: Option<NodeId>,
    backups: Vec<NodeId>,
}

/// In-memory mastership assignment shared by all nodes of a process
///
/// Stands in for the cluster's election service: whoever computes mastership
/// writes it here and every node reads the same table.
pub struct MastershipTable {
    assignments: DashMap<DeviceId, Assignment>,
    events: broadcast::Sender<MastershipEvent>,
}

impl MastershipTable {
    pub fn new(queue_size: usize) -> Self {
        let (events, _) = broadcast::channel(queue_size);
        Self {
            assignments: DashMap::new(),
            events,
        }
    }

    /// Assign a master and backups to a device
    pub fn set_master(&self, device_id: &DeviceId, master: NodeId, backups: Vec<NodeId>) {
        self.update(device_id, Some(master), backups);
    }

    /// Leave a device without a master, keeping its backups
    pub fn relinquish(&self, device_id: &DeviceId) {
        let backups = self.backups_for(device_id);
        self.update(device_id, None, backups);
    }

    fn update(&self, device_id: &DeviceId, master: Option<NodeId>, backups: Vec<NodeId>) {
        // The entry guard is held until the event is sent so events for one
        // device leave in assignment order.
        let mut entry = self.assignments.entry(device_id.clone()).or_default();
        let previous = std::mem::replace(
            &mut *entry,
            Assignment {
                master: master.clone(),
                backups: backups.clone(),
            },
        );

        let event_type = if previous.master != master {
            MastershipEventType::MasterChanged
        } else if previous.backups != backups {
            MastershipEventType::BackupsChanged
        } else {
            return;
        };

        match &master {
            Some(node) => info!(device_id = %device_id, master = %node, "{}", event_type),
            None => info!(device_id = %device_id, "{}: no master", event_type),
        }

        let event = MastershipEvent {
            event_type,
            device_id: device_id.clone(),
            master,
            backups,
        };
        if self.events.send(event).is_err() {
            debug!(device_id = %device_id, "No mastership subscribers");
        }
        drop(entry);
    }
}

impl Default for MastershipTable {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MastershipSource for MastershipTable {
    fn master_for(&self, device_id: &DeviceId) -> Option<NodeId> {
        self.assignments
            .get(device_id)
            .and_then(|a| a.master.clone())
    }

    fn backups_for(&self, device_id: &DeviceId) -> Vec<NodeId> {
        self.assignments
            .get(device_id)
            .map(|a| a.backups.clone())
            .unwrap_or_default()
    }

    fn devices(&self) -> Vec<DeviceId> {
        self.assignments.iter().map(|e| e.key().clone()).collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<MastershipEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device_has_no_master() {
        let table = MastershipTable::default();
        let device = DeviceId::new("of:1");
        assert!(table.master_for(&device).is_none());
        assert!(table.backups_for(&device).is_empty());
        assert!(table.devices().is_empty());
    }

    #[test]
    fn test_set_master_emits_events() {
        let table = MastershipTable::default();
        let mut rx = table.subscribe();
        let device = DeviceId::new("of:1");

        table.set_master(&device, NodeId::new("n1"), vec![NodeId::new("n2")]);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, MastershipEventType::MasterChanged);
        assert_eq!(event.master, Some(NodeId::new("n1")));

        // Same assignment is not an event
        table.set_master(&device, NodeId::new("n1"), vec![NodeId::new("n2")]);
        assert!(rx.try_recv().is_err());

        table.set_master(
            &device,
            NodeId::new("n1"),
            vec![NodeId::new("n2"), NodeId::new("n3")],
        );
        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, MastershipEventType::BackupsChanged);
        assert_eq!(event.backups.len(), 2);
    }

    #[test]
    fn test_relinquish_keeps_backups() {
        let table = MastershipTable::default();
        let device = DeviceId::new("of:1");
        table.set_master(&device, NodeId::new("n1"), vec![NodeId::new("n2")]);

        let mut rx = table.subscribe();
        table.relinquish(&device);

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, MastershipEventType::MasterChanged);
        assert!(event.master.is_none());
        assert_eq!(table.backups_for(&device), vec![NodeId::new("n2")]);
    }
}

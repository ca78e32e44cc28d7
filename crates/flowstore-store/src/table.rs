// Rule table
// Per-device flow entry shards. Each device has its own lock, so writers to
// one device never block readers or writers of another.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use flowstore_api::{FlowEntry, FlowEntryState, FlowRule};
use flowstore_common::DeviceId;

/// Result of a direct add-or-update
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A pending entry was confirmed by the update
    Added(FlowEntry),
    /// An existing entry had its counters refreshed
    Updated(FlowEntry),
    /// The entry was unknown and has been inserted as given
    Inserted,
}

/// Flow entries of a single device
#[derive(Debug, Default)]
pub struct DeviceShard {
    entries: HashMap<FlowRule, FlowEntry>,
}

impl DeviceShard {
    pub fn lookup(&self, rule: &FlowRule) -> Option<&FlowEntry> {
        self.entries.get(rule)
    }

    /// Insert `rule` as `PENDING_ADD` unless an equal rule is already present
    ///
    /// A `FAILED` entry is staged again; any other present entry is a duplicate.
    pub fn apply_add(&mut self, rule: &FlowRule) -> bool {
        match self.entries.get_mut(rule) {
            Some(entry) if entry.state() == FlowEntryState::Failed => {
                entry.set_state(FlowEntryState::PendingAdd);
                true
            }
            Some(_) => false,
            None => {
                self.entries
                    .insert(rule.clone(), FlowEntry::new(rule.clone()));
                true
            }
        }
    }

    /// Mark a present entry `PENDING_REMOVE`; an absent rule is skipped
    pub fn apply_remove(&mut self, rule: &FlowRule) -> Option<FlowEntry> {
        let entry = self.entries.get_mut(rule)?;
        entry.set_state(FlowEntryState::PendingRemove);
        Some(entry.clone())
    }

    /// Mark a pending add `ADDED`; entries in any other state are left alone
    pub fn confirm_added(&mut self, rule: &FlowRule) -> Option<FlowEntry> {
        self.transition_from(rule, FlowEntryState::PendingAdd, FlowEntryState::Added)
    }

    pub fn confirm_removed(&mut self, rule: &FlowRule) -> Option<FlowEntry> {
        self.entries.remove(rule)
    }

    /// Mark a pending add `FAILED`; entries in any other state are left alone
    pub fn mark_failed(&mut self, rule: &FlowRule) -> Option<FlowEntry> {
        self.transition_from(rule, FlowEntryState::PendingAdd, FlowEntryState::Failed)
    }

    /// Undo a staged removal that did not happen
    pub fn revert_removal(&mut self, rule: &FlowRule) -> Option<FlowEntry> {
        self.transition_from(rule, FlowEntryState::PendingRemove, FlowEntryState::Added)
    }

    pub fn add_or_update(&mut self, entry: FlowEntry) -> UpdateOutcome {
        match self.entries.get_mut(entry.rule()) {
            Some(stored) => {
                stored.copy_counters(&entry);
                if stored.state() == FlowEntryState::PendingAdd {
                    stored.set_state(FlowEntryState::Added);
                    UpdateOutcome::Added(stored.clone())
                } else {
                    UpdateOutcome::Updated(stored.clone())
                }
            }
            None => {
                self.entries.insert(entry.rule().clone(), entry);
                UpdateOutcome::Inserted
            }
        }
    }

    pub fn remove(&mut self, rule: &FlowRule) -> Option<FlowEntry> {
        self.entries.remove(rule)
    }

    pub fn entries(&self) -> Vec<FlowEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn transition_from(
        &mut self,
        rule: &FlowRule,
        from: FlowEntryState,
        to: FlowEntryState,
    ) -> Option<FlowEntry> {
        let entry = self.entries.get_mut(rule)?;
        if entry.state() != from {
            return None;
        }
        entry.set_state(to);
        Some(entry.clone())
    }
}

/// In-memory rule table of the devices this node masters
///
/// Every method is atomic on its own. Multi-step mutations of one device go
/// through [`FlowTable::write`], which holds the device lock for the whole
/// closure.
#[derive(Default)]
pub struct FlowTable {
    shards: DashMap<DeviceId, Arc<RwLock<DeviceShard>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, rule: &FlowRule) -> Option<FlowEntry> {
        let shard = self.shard(rule.device_id())?;
        let guard = shard.read();
        guard.lookup(rule).cloned()
    }

    /// Immutable copy of every entry of a device
    pub fn snapshot(&self, device_id: &DeviceId) -> Vec<FlowEntry> {
        self.shard(device_id)
            .map(|shard| shard.read().entries())
            .unwrap_or_default()
    }

    pub fn apply_add(&self, rule: &FlowRule) -> bool {
        self.write(rule.device_id(), |shard| shard.apply_add(rule))
    }

    pub fn apply_remove(&self, rule: &FlowRule) -> Option<FlowEntry> {
        self.write(rule.device_id(), |shard| shard.apply_remove(rule))
    }

    pub fn confirm_added(&self, rule: &FlowRule) -> Option<FlowEntry> {
        self.write(rule.device_id(), |shard| shard.confirm_added(rule))
    }

    pub fn confirm_removed(&self, rule: &FlowRule) -> Option<FlowEntry> {
        self.write(rule.device_id(), |shard| shard.confirm_removed(rule))
    }

    /// Run `f` with exclusive access to a device shard, creating it if needed
    pub fn write<R>(&self, device_id: &DeviceId, f: impl FnOnce(&mut DeviceShard) -> R) -> R {
        // Clone the shard handle out so the map guard is not held under the device lock
        let shard = self
            .shards
            .entry(device_id.clone())
            .or_default()
            .value()
            .clone();
        let mut guard = shard.write();
        f(&mut guard)
    }

    /// Like [`FlowTable::write`], but only if the device already has a shard
    pub fn modify<R>(
        &self,
        device_id: &DeviceId,
        f: impl FnOnce(&mut DeviceShard) -> R,
    ) -> Option<R> {
        let shard = self.shard(device_id)?;
        let mut guard = shard.write();
        Some(f(&mut guard))
    }

    /// Replace a device shard with the given entries
    pub fn load_shard(&self, device_id: &DeviceId, entries: Vec<FlowEntry>) {
        let shard = DeviceShard {
            entries: entries
                .into_iter()
                .map(|entry| (entry.rule().clone(), entry))
                .collect(),
        };
        self.shards
            .insert(device_id.clone(), Arc::new(RwLock::new(shard)));
    }

    /// Remove a device shard, returning its entries
    pub fn drop_shard(&self, device_id: &DeviceId) -> Option<Vec<FlowEntry>> {
        self.shards
            .remove(device_id)
            .map(|(_, shard)| shard.read().entries())
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.shards.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of entries stored for a device
    pub fn len(&self, device_id: &DeviceId) -> usize {
        self.shard(device_id)
            .map(|shard| shard.read().len())
            .unwrap_or(0)
    }

    fn shard(&self, device_id: &DeviceId) -> Option<Arc<RwLock<DeviceShard>>> {
        self.shards.get(device_id).map(|s| s.value().clone())
    }
}

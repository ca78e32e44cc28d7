//! Flow rule data model
//!
//! A [`FlowRule`] is the immutable identity of a forwarding instruction. A
//! [`FlowEntry`] wraps a rule with its lifecycle state and runtime counters.
//! Two rules with equal fields are the same rule.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use flowstore_common::{ApplicationId, BatchId, DeviceId, NodeId};

pub const DEFAULT_TABLE_ID: u32 = 0;
pub const DEFAULT_PRIORITY: u32 = 32768;

/// Match/action forwarding instruction for one device
///
/// Fields are private so the identity cannot change after creation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRule {
    device_id: DeviceId,
    payload: Vec<u8>,
    priority: u32,
    app_id: ApplicationId,
    table_id: u32,
}

impl FlowRule {
    pub fn builder(device_id: DeviceId, app_id: ApplicationId) -> FlowRuleBuilder {
        FlowRuleBuilder::new(device_id, app_id)
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Opaque match/action blob
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn app_id(&self) -> &ApplicationId {
        &self.app_id
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }
}

pub struct FlowRuleBuilder {
    device_id: DeviceId,
    app_id: ApplicationId,
    payload: Vec<u8>,
    priority: u32,
    table_id: u32,
}

impl FlowRuleBuilder {
    pub fn new(device_id: DeviceId, app_id: ApplicationId) -> Self {
        Self {
            device_id,
            app_id,
            payload: Vec::new(),
            priority: DEFAULT_PRIORITY,
            table_id: DEFAULT_TABLE_ID,
        }
    }

    pub fn payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn table_id(mut self, table_id: u32) -> Self {
        self.table_id = table_id;
        self
    }

    pub fn build(self) -> FlowRule {
        FlowRule {
            device_id: self.device_id,
            payload: self.payload,
            priority: self.priority,
            app_id: self.app_id,
            table_id: self.table_id,
        }
    }
}

/// Lifecycle state of a flow entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowEntryState {
    #[default]
    PendingAdd,
    Added,
    PendingRemove,
    Removed,
    Failed,
}

impl std::fmt::Display for FlowEntryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowEntryState::PendingAdd => write!(f, "PENDING_ADD"),
            FlowEntryState::Added => write!(f, "ADDED"),
            FlowEntryState::PendingRemove => write!(f, "PENDING_REMOVE"),
            FlowEntryState::Removed => write!(f, "REMOVED"),
            FlowEntryState::Failed => write!(f, "FAILED"),
        }
    }
}

/// A flow rule plus its mutable state and counters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowEntry {
    rule: FlowRule,
    state: FlowEntryState,
    /// Packets matched by this entry
    pub packets: u64,
    /// Bytes matched by this entry
    pub bytes: u64,
    /// Seconds the entry has been installed
    pub duration_secs: u64,
}

impl FlowEntry {
    /// Create an entry in `PENDING_ADD` with zeroed counters
    pub fn new(rule: FlowRule) -> Self {
        Self::with_state(rule, FlowEntryState::PendingAdd)
    }

    pub fn with_state(rule: FlowRule, state: FlowEntryState) -> Self {
        Self {
            rule,
            state,
            packets: 0,
            bytes: 0,
            duration_secs: 0,
        }
    }

    pub fn rule(&self) -> &FlowRule {
        &self.rule
    }

    pub fn device_id(&self) -> &DeviceId {
        self.rule.device_id()
    }

    pub fn state(&self) -> FlowEntryState {
        self.state
    }

    pub fn set_state(&mut self, state: FlowEntryState) {
        self.state = state;
    }

    /// Copy the runtime counters from another observation of the same rule
    pub fn copy_counters(&mut self, other: &FlowEntry) {
        self.packets = other.packets;
        self.bytes = other.bytes;
        self.duration_secs = other.duration_secs;
    }
}

/// Operator of a batch operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowRuleOperation {
    Add,
    Remove,
}

impl std::fmt::Display for FlowRuleOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowRuleOperation::Add => write!(f, "ADD"),
            FlowRuleOperation::Remove => write!(f, "REMOVE"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub operator: FlowRuleOperation,
    pub target: FlowRule,
}

impl BatchOperation {
    pub fn add(rule: FlowRule) -> Self {
        Self {
            operator: FlowRuleOperation::Add,
            target: rule,
        }
    }

    pub fn remove(rule: FlowRule) -> Self {
        Self {
            operator: FlowRuleOperation::Remove,
            target: rule,
        }
    }
}

/// Ordered list of operations, by convention targeting one device
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRuleBatch {
    pub operations: Vec<BatchOperation>,
}

impl FlowRuleBatch {
    pub fn new(operations: Vec<BatchOperation>) -> Self {
        Self { operations }
    }

    pub fn add(mut self, rule: FlowRule) -> Self {
        self.operations.push(BatchOperation::add(rule));
        self
    }

    pub fn remove(mut self, rule: FlowRule) -> Self {
        self.operations.push(BatchOperation::remove(rule));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Device of the first operation, which routes the whole batch
    pub fn device_id(&self) -> Option<&DeviceId> {
        self.operations.first().map(|op| op.target.device_id())
    }

    /// Whether some operation targets a device other than the first one
    pub fn spans_multiple_devices(&self) -> bool {
        match self.device_id() {
            Some(first) => self
                .operations
                .iter()
                .any(|op| op.target.device_id() != first),
            None => false,
        }
    }

    pub fn targets(&self) -> impl Iterator<Item = &FlowRule> {
        self.operations.iter().map(|op| &op.target)
    }
}

/// Outcome of a batch; partial failures are listed per rule
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedBatchOperation {
    pub success: bool,
    pub failed_rules: HashSet<FlowRule>,
}

impl CompletedBatchOperation {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            failed_rules: HashSet::new(),
        }
    }

    pub fn failed(failed_rules: HashSet<FlowRule>) -> Self {
        Self {
            success: false,
            failed_rules,
        }
    }

    /// Every target of the batch failed
    pub fn all_failed(batch: &FlowRuleBatch) -> Self {
        Self::failed(batch.targets().cloned().collect())
    }

    pub fn is_failed(&self, rule: &FlowRule) -> bool {
        self.failed_rules.contains(rule)
    }
}

/// Current master and backups of a device
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaInfo {
    pub device_id: DeviceId,
    pub master: Option<NodeId>,
    pub backups: Vec<NodeId>,
}

impl ReplicaInfo {
    pub fn new(device_id: DeviceId, master: Option<NodeId>, backups: Vec<NodeId>) -> Self {
        Self {
            device_id,
            master,
            backups,
        }
    }

    /// Replica info for a device nobody masters
    pub fn no_master(device_id: DeviceId) -> Self {
        Self::new(device_id, None, Vec::new())
    }

    pub fn is_master(&self, node: &NodeId) -> bool {
        self.master.as_ref() == Some(node)
    }
}

/// Staged work handed to the rule-application delegate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRuleBatchRequest {
    pub batch_id: BatchId,
    pub device_id: DeviceId,
    pub to_add: Vec<FlowRule>,
    pub to_remove: Vec<FlowRule>,
}

impl FlowRuleBatchRequest {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Type of per-rule store event
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowRuleEventType {
    RuleAdded,
    RuleUpdated,
    RuleRemoved,
}

impl std::fmt::Display for FlowRuleEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowRuleEventType::RuleAdded => write!(f, "RULE_ADDED"),
            FlowRuleEventType::RuleUpdated => write!(f, "RULE_UPDATED"),
            FlowRuleEventType::RuleRemoved => write!(f, "RULE_REMOVED"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlowRuleEvent {
    pub event_type: FlowRuleEventType,
    pub entry: FlowEntry,
}

impl FlowRuleEvent {
    pub fn new(event_type: FlowRuleEventType, entry: FlowEntry) -> Self {
        Self { event_type, entry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(device: &str, priority: u32) -> FlowRule {
        FlowRule::builder(DeviceId::new(device), ApplicationId::new(1, "test"))
            .payload(vec![0x0a, 0x0b])
            .priority(priority)
            .build()
    }

    #[test]
    fn test_flow_rule_value_equality() {
        assert_eq!(rule("of:1", 10), rule("of:1", 10));
        assert_ne!(rule("of:1", 10), rule("of:1", 11));
        assert_ne!(rule("of:1", 10), rule("of:2", 10));
    }

    #[test]
    fn test_flow_entry_starts_pending_add() {
        let entry = FlowEntry::new(rule("of:1", 10));
        assert_eq!(entry.state(), FlowEntryState::PendingAdd);
        assert_eq!(entry.packets, 0);
        assert_eq!(entry.rule(), &rule("of:1", 10));
    }

    #[test]
    fn test_batch_device_routing() {
        let batch = FlowRuleBatch::default();
        assert!(batch.device_id().is_none());
        assert!(!batch.spans_multiple_devices());

        let batch = FlowRuleBatch::default()
            .add(rule("of:1", 1))
            .remove(rule("of:1", 2));
        assert_eq!(batch.device_id(), Some(&DeviceId::new("of:1")));
        assert!(!batch.spans_multiple_devices());

        let batch = batch.add(rule("of:2", 3));
        assert!(batch.spans_multiple_devices());
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn test_completed_batch_all_failed() {
        let batch = FlowRuleBatch::default()
            .add(rule("of:1", 1))
            .add(rule("of:1", 2));
        let result = CompletedBatchOperation::all_failed(&batch);
        assert!(!result.success);
        assert_eq!(result.failed_rules.len(), 2);
        assert!(result.is_failed(&rule("of:1", 2)));
    }

    #[test]
    fn test_replica_info_is_master() {
        let info = ReplicaInfo::new(
            DeviceId::new("of:1"),
            Some(NodeId::new("n1")),
            vec![NodeId::new("n2")],
        );
        assert!(info.is_master(&NodeId::new("n1")));
        assert!(!info.is_master(&NodeId::new("n2")));
        assert!(!ReplicaInfo::no_master(DeviceId::new("of:1")).is_master(&NodeId::new("n1")));
    }

    #[test]
    fn test_state_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&FlowEntryState::PendingRemove).unwrap(),
            "\"PENDING_REMOVE\""
        );
        assert_eq!(FlowEntryState::Added.to_string(), "ADDED");
    }
}

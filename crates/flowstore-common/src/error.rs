//! Error types for flowstore
//!
//! `FlowStoreError` covers the failures a caller of the flow rule store can
//! observe. An unknown rule or device on lookup is not an error: lookups
//! return `Option` or an empty collection instead.

use std::time::Duration;

use crate::id::{BatchId, DeviceId, NodeId};

/// Flow rule store error types
#[derive(thiserror::Error, Debug)]
pub enum FlowStoreError {
    /// The master for a device could not be determined or reached
    #[error("routing failure for device {device}: {reason}")]
    Routing { device: DeviceId, reason: String },

    /// A forwarded request exceeded its deadline
    #[error("request '{subject}' to {target} timed out after {after:?}")]
    Timeout {
        target: NodeId,
        subject: String,
        after: Duration,
    },

    /// A mutation reached a node that is not master for the device
    #[error("node {node} is not master for device {device}, mutation rejected")]
    RejectedMutation { device: DeviceId, node: NodeId },

    /// Encoding or decoding of a cluster message failed
    #[error("codec error: {0}")]
    Codec(String),

    /// The pending completion was dropped before the delegate resolved it
    #[error("completion for batch {0} was dropped before it was resolved")]
    CompletionDropped(BatchId),

    /// The store is not running
    #[error("flow rule store is stopped")]
    Stopped,
}

impl FlowStoreError {
    pub fn routing(device: &DeviceId, reason: impl Into<String>) -> Self {
        FlowStoreError::Routing {
            device: device.clone(),
            reason: reason.into(),
        }
    }

    /// Whether the error was produced while talking to another node
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            FlowStoreError::Routing { .. } | FlowStoreError::Timeout { .. }
        )
    }
}

impl From<serde_json::Error> for FlowStoreError {
    fn from(value: serde_json::Error) -> Self {
        FlowStoreError::Codec(value.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FlowStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_store_error_display() {
        let err = FlowStoreError::routing(&DeviceId::new("of:1"), "no master");
        assert_eq!(
            format!("{}", err),
            "routing failure for device of:1: no master"
        );

        let err = FlowStoreError::RejectedMutation {
            device: DeviceId::new("of:1"),
            node: NodeId::new("n2"),
        };
        assert_eq!(
            format!("{}", err),
            "node n2 is not master for device of:1, mutation rejected"
        );

        let err = FlowStoreError::CompletionDropped(BatchId::new(3));
        assert_eq!(
            format!("{}", err),
            "completion for batch 3 was dropped before it was resolved"
        );
    }

    #[test]
    fn test_is_remote() {
        let timeout = FlowStoreError::Timeout {
            target: NodeId::new("n1"),
            subject: "APPLY_BATCH".to_string(),
            after: Duration::from_secs(5),
        };
        assert!(timeout.is_remote());
        assert!(!FlowStoreError::Stopped.is_remote());
    }

    #[test]
    fn test_codec_from_serde() {
        let err: FlowStoreError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(matches!(err, FlowStoreError::Codec(_)));
    }
}

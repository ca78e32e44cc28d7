//! Flowstore Core - Cluster plumbing
//!
//! This crate provides:
//! - Application configuration access
//! - Device mastership feed and the replica info resolver built on it
//! - The cluster messenger contract and an in-process transport

pub mod model;
pub mod service;

// Re-export commonly used types
pub use model::Configuration;
pub use service::{
    local_fabric::{LocalClusterFabric, LocalClusterMessenger},
    mastership::{MastershipEvent, MastershipEventType, MastershipSource, MastershipTable},
    messenger::{
        ClusterMessageHandler, ClusterMessenger, MessagingError, RequestHandler,
        TypedMessageHandler, send_request,
    },
    replica::{MastershipResolver, ReplicaInfoEvent},
};

//! Flowstore Common - Shared identifiers and error types
//!
//! This crate provides:
//! - Strongly typed identifiers for devices, cluster nodes and applications
//! - `FlowStoreError`: the error taxonomy surfaced by the flow rule store

pub mod error;
pub mod id;

pub use error::{FlowStoreError, Result};
pub use id::{ApplicationId, BatchId, DeviceId, NodeId};

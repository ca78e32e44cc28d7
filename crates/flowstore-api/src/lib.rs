//! Flowstore API - Flow rule model and cluster message contracts
//!
//! This crate provides:
//! - Flow rules, flow entries and batch operations
//! - Replica (mastership) information for a device
//! - Versioned encode/decode contracts for each cluster message subject

pub mod model;
pub mod remote;

// Re-export commonly used types
pub use model::*;
pub use remote::model::{ClusterRequest, MessageSubject};

//! Flowstore Store - Mastership-routed flow rule store
//!
//! This crate provides:
//! - The per-device rule table
//! - The completion registry correlating batch ids with waiting callers
//! - The flow rule store coordinating local application and forwarding
//! - Inbound cluster message handlers and backup replication
//! - The store event stream

pub mod backup;
pub mod completion;
pub mod config;
pub mod delegate;
pub mod event;
pub mod handler;
pub mod metrics;
pub mod store;
pub mod table;

// Re-export commonly used types
pub use backup::{BackupTable, BackupWorker};
pub use completion::{BatchFuture, CompletionRegistry, StagedBatch};
pub use config::FlowStoreConfig;
pub use delegate::FlowRuleStoreDelegate;
pub use event::{EventDispatcher, FlowStoreEvent};
pub use store::FlowRuleStore;
pub use table::{DeviceShard, FlowTable, UpdateOutcome};

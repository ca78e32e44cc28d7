//! Flowstore Server - Simulation binary support
//!
//! This crate provides:
//! - Logging bootstrap and shutdown signal handling
//! - Metric descriptions for the store's counters and gauges
//! - An in-process multi-node cluster driven by a loopback delegate

pub mod metrics;
pub mod simulation;
pub mod startup;

pub use simulation::{LoopbackDelegate, Simulation, SimulationConfig, SimulationReport};

//! Node-local GPU memory sharing plugin.
//!
//! Binds workloads that a cluster scheduler placed on this node to physical
//! devices, persists the binding in the workload's metadata, and returns the
//! runtime parameters each container needs to see its share of GPU memory.

pub mod api;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod resolver;
pub mod store;
pub mod units;
pub mod workload;
pub mod writer;

#[cfg(test)]
mod engine_tests;

pub use config::Config;
pub use device::{Device, DeviceIndex, DeviceRegistry};
pub use engine::{AllocationDecision, AllocationEngine, AllocationFailure, AllocationRequest};
pub use error::{PluginError, RegistryError, Result, StoreError};
pub use units::{MemoryUnit, Units};
pub use workload::{Workload, WorkloadId};

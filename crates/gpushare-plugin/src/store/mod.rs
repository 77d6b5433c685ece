//! Workload metadata store client interface.

pub mod kube;
pub mod memory;

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

use crate::error::StoreError;
use crate::workload::{Workload, WorkloadId};

pub use kube::{KubeStore, KubeStoreConfig};
pub use memory::InMemoryStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Cluster-side record of workloads.
///
/// Conditional updates are the only concurrency control: `update` must fail
/// with [`StoreError::Conflict`] when the stored version differs from the
/// `resource_version` carried by the argument.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    /// Fetch one workload by identity
    async fn get(&self, id: &WorkloadId) -> StoreResult<Workload>;

    /// Live workloads on `node_name` that request shared GPU memory
    async fn list_on_node(&self, node_name: &str) -> StoreResult<Vec<Workload>>;

    /// Replace the workload's annotations if its version is current; returns
    /// the stored result with its new version.
    async fn update(&self, workload: &Workload) -> StoreResult<Workload>;
}

/// Runs a store call under a caller-side deadline.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

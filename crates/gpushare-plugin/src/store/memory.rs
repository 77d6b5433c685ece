//! In-process workload store with fault injection.
//!
//! Stands in for the cluster store in tests and local runs. Versions are a
//! monotonically increasing counter; every successful update bumps it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{StoreResult, WorkloadStore};
use crate::error::StoreError;
use crate::workload::{Workload, WorkloadId};

#[derive(Debug, Default)]
struct Faults {
    /// Upcoming updates that fail as if another writer got there first
    pending_conflicts: usize,
    unavailable: bool,
    latency: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    workloads: Mutex<BTreeMap<WorkloadId, Workload>>,
    next_version: AtomicUsize,
    faults: Mutex<Faults>,
    update_calls: AtomicUsize,
    list_calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump_version(&self) -> String {
        (self.next_version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Inserts or replaces a workload, stamping a fresh version.
    pub fn insert(&self, mut workload: Workload) -> Workload {
        workload.resource_version = self.bump_version();
        self.workloads
            .lock()
            .insert(workload.id.clone(), workload.clone());
        workload
    }

    pub fn workload(&self, id: &WorkloadId) -> Option<Workload> {
        self.workloads.lock().get(id).cloned()
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.workloads.lock().values().cloned().collect()
    }

    /// Makes the next `count` updates fail with a conflict. Each injected
    /// conflict also bumps the stored version, like an out-of-band writer.
    pub fn inject_conflicts(&self, count: usize) {
        self.faults.lock().pending_conflicts = count;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.lock().unavailable = unavailable;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> StoreResult<()> {
        let (latency, unavailable) = {
            let faults = self.faults.lock();
            (faults.latency, faults.unavailable)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unavailable {
            return Err(StoreError::Unavailable("in-memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadStore for InMemoryStore {
    async fn get(&self, id: &WorkloadId) -> StoreResult<Workload> {
        self.enter().await?;
        self.workload(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list_on_node(&self, node_name: &str) -> StoreResult<Vec<Workload>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;
        Ok(self
            .workloads
            .lock()
            .values()
            .filter(|w| w.node_name == node_name && w.requested().is_some())
            .cloned()
            .collect())
    }

    async fn update(&self, workload: &Workload) -> StoreResult<Workload> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        self.enter().await?;

        let injected = {
            let mut faults = self.faults.lock();
            if faults.pending_conflicts > 0 {
                faults.pending_conflicts -= 1;
                true
            } else {
                false
            }
        };

        let mut workloads = self.workloads.lock();
        let stored = workloads
            .get_mut(&workload.id)
            .ok_or_else(|| StoreError::NotFound(workload.id.to_string()))?;

        if injected {
            stored.resource_version = self.bump_version();
            return Err(StoreError::Conflict(workload.id.to_string()));
        }
        if stored.resource_version != workload.resource_version {
            return Err(StoreError::Conflict(workload.id.to_string()));
        }

        stored.annotations = workload.annotations.clone();
        stored.resource_version = self.bump_version();
        Ok(stored.clone())
    }
}

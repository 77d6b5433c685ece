//! Finds the workloads on this node that are waiting for a device binding.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceIndex;
use crate::error::StoreError;
use crate::store::{bounded, WorkloadStore};
use crate::units::Units;
use crate::workload::Workload;

/// One read of the node's workloads
#[derive(Debug, Clone, Default)]
pub struct NodeSnapshot {
    /// Unbound workloads in selection order
    pub candidates: Vec<Workload>,
    /// Units already committed to each device by bound workloads
    pub committed_units: BTreeMap<DeviceIndex, Units>,
}

impl NodeSnapshot {
    pub fn committed_on(&self, index: DeviceIndex) -> Units {
        self.committed_units.get(&index).copied().unwrap_or(0)
    }
}

pub struct CandidateResolver {
    store: Arc<dyn WorkloadStore>,
    timeout: Duration,
}

impl CandidateResolver {
    pub fn new(store: Arc<dyn WorkloadStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Candidates on `node_name`, oldest assumption first. Store errors are
    /// returned as-is.
    pub async fn find_candidates(&self, node_name: &str) -> Result<Vec<Workload>, StoreError> {
        Ok(self.snapshot(node_name).await?.candidates)
    }

    /// Candidates plus per-device usage, from a single store read.
    pub async fn snapshot(&self, node_name: &str) -> Result<NodeSnapshot, StoreError> {
        let workloads = bounded(self.timeout, self.store.list_on_node(node_name)).await?;

        let committed_units = committed_units(&workloads);
        let mut candidates: Vec<Workload> = workloads
            .into_iter()
            .filter(Workload::is_candidate)
            .collect();
        order_candidates(&mut candidates);

        Ok(NodeSnapshot {
            candidates,
            committed_units,
        })
    }
}

/// Ascending assume time, then namespace and name. Workloads without a
/// readable assume time sort last.
pub fn order_candidates(candidates: &mut [Workload]) {
    candidates.sort_by_cached_key(|w| {
        let assumed = w.assignment().assume_time;
        (assumed.is_none(), assumed, w.id.clone())
    });
}

/// Splits each bound workload's request evenly (rounding up) across the
/// devices it is bound to.
pub fn committed_units(workloads: &[Workload]) -> BTreeMap<DeviceIndex, Units> {
    let mut usage = BTreeMap::new();
    for workload in workloads {
        let assignment = workload.assignment();
        let Some(requested) = workload.requested() else {
            continue;
        };
        if !assignment.assigned || assignment.device_indices.is_empty() {
            continue;
        }
        let share = per_device_share(requested, assignment.device_indices.len());
        for index in assignment.device_indices {
            let used: &mut Units = usage.entry(index).or_insert(0);
            *used = used.saturating_add(share);
        }
    }
    usage
}

pub(crate) fn per_device_share(units: Units, device_count: usize) -> Units {
    if device_count <= 1 {
        units
    } else {
        units.div_ceil(device_count as Units)
    }
}

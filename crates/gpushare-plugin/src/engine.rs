//! Allocation engine: turns an allocation request into a committed device
//! binding and the runtime parameters for each container.
//!
//! # Flow
//!
//! 1. Sum the units requested by the containers.
//! 2. Read the node's candidates (oldest assumption first).
//! 3. Take the first candidate whose request equals the sum exactly.
//! 4. Use the candidate's pinned devices, or pick the lowest-index device
//!    with enough free units.
//! 5. Resolve indices to handles, compute the memory fraction.
//! 6. Commit the binding, then answer.
//!
//! Every failure becomes an [`AllocationDecision::Failed`]; nothing here
//! returns an error to the protocol layer. Callers serialize `allocate`
//! calls (see [`crate::api::AppState::allocate`]).

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceIndex, DeviceRegistry};
use crate::error::StoreError;
use crate::resolver::{per_device_share, CandidateResolver, NodeSnapshot};
use crate::units::Units;
use crate::workload::{join_indices, Workload, WorkloadId};
use crate::writer::{AssignmentWriter, CommitError};

/// Runtime parameter names delivered to each container
pub mod env {
    pub const NVIDIA_VISIBLE_DEVICES: &str = "NVIDIA_VISIBLE_DEVICES";
    pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";
    pub const RESOURCE_INDEX: &str = "GPUSHARE_MEM_IDX";
    pub const RESOURCE_BY_POD: &str = "GPUSHARE_MEM_POD";
    pub const RESOURCE_BY_CONTAINER: &str = "GPUSHARE_MEM_CONTAINER";
    pub const RESOURCE_BY_DEV: &str = "GPUSHARE_MEM_DEV";
    pub const MEMORY_FRACTION: &str = "GPU_MEMORY_FRACTION";
}

/// Units demanded by one container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerRequest {
    pub units: Units,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRequest {
    pub containers: Vec<ContainerRequest>,
}

impl AllocationRequest {
    pub fn new(units: impl IntoIterator<Item = Units>) -> Self {
        Self {
            containers: units.into_iter().map(|units| ContainerRequest { units }).collect(),
        }
    }

    /// Sum of the container requests; `None` if it does not fit in [`Units`].
    pub fn total_units(&self) -> Option<Units> {
        self.containers
            .iter()
            .try_fold(0, |acc: Units, c| acc.checked_add(c.units))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationFailure {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store timed out: {0}")]
    StoreTimeout(String),

    #[error("concurrent writer kept modifying {0}")]
    Conflict(String),

    #[error("container requests overflow the unit counter")]
    RequestOverflow,

    #[error("no candidate requests exactly {0} units")]
    Unsatisfiable(Units),

    #[error("no device has {0} free units")]
    NoDeviceCapacity(Units),

    #[error("none of devices [{0}] are registered")]
    DeviceNotFound(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),
}

impl From<StoreError> for AllocationFailure {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(_) => AllocationFailure::StoreTimeout(err.to_string()),
            StoreError::Conflict(id) => AllocationFailure::Conflict(id),
            StoreError::Unavailable(_) => AllocationFailure::StoreUnavailable(err.to_string()),
            StoreError::NotFound(_) | StoreError::Malformed(_) => {
                AllocationFailure::CommitFailed(err.to_string())
            }
        }
    }
}

impl From<CommitError> for AllocationFailure {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Store(store) => store.into(),
            CommitError::AlreadyBound(_) => AllocationFailure::CommitFailed(err.to_string()),
        }
    }
}

/// A committed binding
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub workload: WorkloadId,
    pub device_indices: Vec<DeviceIndex>,
    pub device_handles: Vec<String>,
    pub total_units: Units,
    /// Capacity of one bound device
    pub device_capacity: Units,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllocationDecision {
    Bound(Binding),
    Failed {
        total_units: Units,
        reason: AllocationFailure,
    },
}

impl AllocationDecision {
    fn failed(total_units: Units, reason: AllocationFailure) -> Self {
        AllocationDecision::Failed {
            total_units,
            reason,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, AllocationDecision::Bound(_))
    }

    pub fn failure(&self) -> Option<&AllocationFailure> {
        match self {
            AllocationDecision::Bound(_) => None,
            AllocationDecision::Failed { reason, .. } => Some(reason),
        }
    }

    /// Runtime parameters, one map per container of `request`.
    ///
    /// Every container of a bound workload gets the same device list and
    /// fraction. A failed decision yields the same number of entries carrying
    /// sentinel values.
    pub fn container_envs(
        &self,
        request: &AllocationRequest,
        registry: &DeviceRegistry,
    ) -> Vec<BTreeMap<String, String>> {
        request
            .containers
            .iter()
            .map(|container| match self {
                AllocationDecision::Bound(binding) => {
                    let visible = binding.device_handles.join(",");
                    envs([
                        (env::NVIDIA_VISIBLE_DEVICES, visible.clone()),
                        (env::CUDA_VISIBLE_DEVICES, visible),
                        (env::RESOURCE_INDEX, join_indices(&binding.device_indices)),
                        (env::RESOURCE_BY_POD, binding.total_units.to_string()),
                        (env::RESOURCE_BY_CONTAINER, container.units.to_string()),
                        (env::RESOURCE_BY_DEV, binding.device_capacity.to_string()),
                        (env::MEMORY_FRACTION, format!("{:.2}", binding.fraction)),
                    ])
                }
                AllocationDecision::Failed { total_units, .. } => {
                    let sentinel = format!("no-gpu-has-{}{}-to-run", total_units, registry.unit());
                    envs([
                        (env::NVIDIA_VISIBLE_DEVICES, sentinel.clone()),
                        (env::CUDA_VISIBLE_DEVICES, sentinel),
                        (env::RESOURCE_INDEX, "-1".to_string()),
                        (env::RESOURCE_BY_POD, total_units.to_string()),
                        (env::RESOURCE_BY_CONTAINER, container.units.to_string()),
                        (env::RESOURCE_BY_DEV, registry.nominal_capacity().to_string()),
                        (env::MEMORY_FRACTION, "0".to_string()),
                    ])
                }
            })
            .collect()
    }
}

fn envs<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// `requested / capacity`, rounded half away from zero to two decimals.
pub fn memory_fraction(requested: Units, capacity: Units) -> f64 {
    if capacity == 0 {
        return 0.0;
    }
    let ratio = requested as f64 / capacity as f64;
    (ratio * 100.0).round() / 100.0
}

pub struct AllocationEngine {
    node_name: String,
    registry: Arc<DeviceRegistry>,
    resolver: CandidateResolver,
    writer: AssignmentWriter,
}

impl AllocationEngine {
    pub fn new(
        node_name: impl Into<String>,
        registry: Arc<DeviceRegistry>,
        resolver: CandidateResolver,
        writer: AssignmentWriter,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            registry,
            resolver,
            writer,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub async fn allocate(&self, request: &AllocationRequest) -> AllocationDecision {
        let Some(total) = request.total_units() else {
            warn!(
                containers = request.containers.len(),
                "Allocation failed: {}",
                AllocationFailure::RequestOverflow
            );
            return AllocationDecision::failed(Units::MAX, AllocationFailure::RequestOverflow);
        };
        info!(
            containers = request.containers.len(),
            total_units = total,
            "Allocating shared GPU memory"
        );

        match self.try_allocate(request, total).await {
            Ok(binding) => {
                info!(
                    workload = %binding.workload,
                    devices = %join_indices(&binding.device_indices),
                    fraction = binding.fraction,
                    "Allocation committed"
                );
                AllocationDecision::Bound(binding)
            }
            Err(reason) => {
                match &reason {
                    AllocationFailure::Unsatisfiable(_) => {
                        info!(total_units = total, "Allocation request can't be satisfied: {}", reason)
                    }
                    _ => warn!(total_units = total, "Allocation failed: {}", reason),
                }
                AllocationDecision::failed(total, reason)
            }
        }
    }

    async fn try_allocate(
        &self,
        request: &AllocationRequest,
        total: Units,
    ) -> Result<Binding, AllocationFailure> {
        if total == 0 {
            return Err(AllocationFailure::Unsatisfiable(0));
        }

        let snapshot = self.resolver.snapshot(&self.node_name).await?;
        for candidate in &snapshot.candidates {
            debug!(
                workload = %candidate.id,
                requested_units = candidate.requested().unwrap_or(0),
                assume_time = ?candidate.assignment().assume_time,
                "Candidate"
            );
        }

        let candidate = snapshot
            .candidates
            .iter()
            .find(|w| w.requested() == Some(total))
            .ok_or(AllocationFailure::Unsatisfiable(total))?;
        info!(workload = %candidate.id, total_units = total, "Found assumed workload");
        if candidate.container_count != request.containers.len() {
            debug!(
                workload = %candidate.id,
                workload_containers = candidate.container_count,
                requested_containers = request.containers.len(),
                "Container count differs from the workload definition"
            );
        }

        let devices = self.choose_devices(candidate, total, &snapshot)?;

        let device_indices: Vec<DeviceIndex> = devices.iter().map(|d| d.index).collect();
        let capacity = devices
            .iter()
            .fold(0, |acc: Units, d| acc.saturating_add(d.capacity_units));
        let binding = Binding {
            workload: candidate.id.clone(),
            device_handles: devices.iter().map(|d| d.handle.clone()).collect(),
            total_units: total,
            device_capacity: devices[0].capacity_units,
            fraction: memory_fraction(total, capacity),
            device_indices,
        };

        self.writer
            .commit(candidate, &binding.device_indices)
            .await?;

        Ok(binding)
    }

    /// Pinned devices when present, otherwise the first device with room.
    ///
    /// Pinned indices the registry does not know are skipped; the request is
    /// split across the devices that remain.
    fn choose_devices(
        &self,
        candidate: &Workload,
        total: Units,
        snapshot: &NodeSnapshot,
    ) -> Result<Vec<Device>, AllocationFailure> {
        let pinned = candidate.assignment().device_indices;
        if pinned.is_empty() {
            return self
                .registry
                .list_devices()
                .iter()
                .find(|d| has_room(snapshot, d, total))
                .map(|d| vec![d.clone()])
                .ok_or(AllocationFailure::NoDeviceCapacity(total));
        }

        let devices = self.resolve_devices(candidate, &pinned)?;
        let share = per_device_share(total, devices.len());
        for device in &devices {
            if !has_room(snapshot, device, share) {
                warn!(
                    workload = %candidate.id,
                    device = device.index,
                    committed = snapshot.committed_on(device.index),
                    share,
                    capacity = device.capacity_units,
                    "Pinned device would be overcommitted"
                );
                return Err(AllocationFailure::NoDeviceCapacity(share));
            }
        }
        Ok(devices)
    }

    /// Unknown indices are skipped; fails only if none resolve.
    fn resolve_devices(
        &self,
        candidate: &Workload,
        indices: &[DeviceIndex],
    ) -> Result<Vec<Device>, AllocationFailure> {
        let mut devices: Vec<Device> = Vec::with_capacity(indices.len());
        for &index in indices {
            if devices.iter().any(|d| d.index == index) {
                continue;
            }
            match self.registry.device_by_index(index) {
                Some(device) => devices.push(device.clone()),
                None => warn!(
                    workload = %candidate.id,
                    device = index,
                    "Failed to find the device for workload, skipping it"
                ),
            }
        }

        if devices.is_empty() {
            return Err(AllocationFailure::DeviceNotFound(join_indices(indices)));
        }
        Ok(devices)
    }
}

fn has_room(snapshot: &NodeSnapshot, device: &Device, units: Units) -> bool {
    let free = device
        .capacity_units
        .saturating_sub(snapshot.committed_on(device.index));
    units <= free
}

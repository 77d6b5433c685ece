//! Typed view of a scheduled workload and of its device assignment.
//!
//! The store keeps assignment state as string annotations on the workload.
//! [`WorkloadAssignment`] decodes them leniently: anything missing or
//! malformed reads as "not assigned" rather than an error.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::device::DeviceIndex;
use crate::units::Units;

/// Annotation keys shared with the upstream scheduler
pub mod annotations {
    /// Extended resource carrying the requested memory units per container
    pub const RESOURCE_NAME: &str = "gpushare.io/gpu-mem";
    /// Comma-joined device indices bound to the workload
    pub const DEVICE_INDEX: &str = "gpushare.io/gpu-mem-idx";
    /// `"true"` once the plugin has committed the binding
    pub const ASSIGNED: &str = "gpushare.io/gpu-mem-assigned";
    /// Unix nanoseconds at which the scheduler assumed the workload
    pub const ASSUME_TIME: &str = "gpushare.io/gpu-mem-assume-time";
    /// Unix nanoseconds at which the plugin committed the binding
    pub const ASSIGN_TIME: &str = "gpushare.io/gpu-mem-assign-time";
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkloadId {
    pub namespace: String,
    pub name: String,
}

impl WorkloadId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Assignment fields decoded from a workload's annotations
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadAssignment {
    /// Pinned or committed device indices; empty if none
    pub device_indices: Vec<DeviceIndex>,
    pub assigned: bool,
    pub assume_time: Option<DateTime<Utc>>,
    pub assign_time: Option<DateTime<Utc>>,
}

impl WorkloadAssignment {
    pub fn from_annotations(map: &BTreeMap<String, String>) -> Self {
        let device_indices = map
            .get(annotations::DEVICE_INDEX)
            .map(|raw| parse_indices(raw))
            .unwrap_or_default();

        let assigned = map
            .get(annotations::ASSIGNED)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

        Self {
            device_indices,
            assigned,
            assume_time: map.get(annotations::ASSUME_TIME).and_then(|v| parse_nanos(v)),
            assign_time: map.get(annotations::ASSIGN_TIME).and_then(|v| parse_nanos(v)),
        }
    }

    /// Writes the assignment fields, leaving every other key untouched.
    pub fn write_annotations(&self, map: &mut BTreeMap<String, String>) {
        if self.device_indices.is_empty() {
            map.remove(annotations::DEVICE_INDEX);
        } else {
            map.insert(
                annotations::DEVICE_INDEX.to_string(),
                join_indices(&self.device_indices),
            );
        }
        map.insert(annotations::ASSIGNED.to_string(), self.assigned.to_string());
        if let Some(t) = self.assume_time {
            map.insert(annotations::ASSUME_TIME.to_string(), format_nanos(t));
        }
        if let Some(t) = self.assign_time {
            map.insert(annotations::ASSIGN_TIME.to_string(), format_nanos(t));
        }
    }
}

/// A workload scheduled onto a node, as read from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub id: WorkloadId,
    pub node_name: String,
    /// Units declared through the extended resource; `None` if the workload
    /// does not use shared GPU memory
    pub requested_units: Option<Units>,
    pub container_count: usize,
    pub annotations: BTreeMap<String, String>,
    /// Opaque version token for conditional updates
    pub resource_version: String,
}

impl Workload {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, node_name: impl Into<String>) -> Self {
        Self {
            id: WorkloadId::new(namespace, name),
            node_name: node_name.into(),
            requested_units: None,
            container_count: 1,
            annotations: BTreeMap::new(),
            resource_version: String::new(),
        }
    }

    pub fn with_requested_units(mut self, units: Units) -> Self {
        self.requested_units = Some(units);
        self
    }

    pub fn with_containers(mut self, count: usize) -> Self {
        self.container_count = count;
        self
    }

    pub fn with_assume_time(mut self, at: DateTime<Utc>) -> Self {
        self.annotations
            .insert(annotations::ASSUME_TIME.to_string(), format_nanos(at));
        self
    }

    /// Pins device indices without marking the workload assigned, the way the
    /// upstream scheduler does.
    pub fn with_pinned_devices(mut self, indices: &[DeviceIndex]) -> Self {
        self.annotations
            .insert(annotations::DEVICE_INDEX.to_string(), join_indices(indices));
        self.annotations
            .insert(annotations::ASSIGNED.to_string(), "false".to_string());
        self
    }

    pub fn assignment(&self) -> WorkloadAssignment {
        WorkloadAssignment::from_annotations(&self.annotations)
    }

    /// Requested units, treating an explicit zero as no request.
    pub fn requested(&self) -> Option<Units> {
        self.requested_units.filter(|&u| u > 0)
    }

    /// Scheduled for shared GPU memory but not yet bound to a device.
    pub fn is_candidate(&self) -> bool {
        self.requested().is_some() && !self.assignment().assigned
    }

    /// New snapshot carrying a committed binding; everything else, including
    /// the resource version, is copied unchanged.
    pub fn with_assignment(&self, indices: &[DeviceIndex], at: DateTime<Utc>) -> Workload {
        let mut assignment = self.assignment();
        assignment.device_indices = indices.to_vec();
        assignment.assigned = true;
        assignment.assign_time = Some(at);

        let mut next = self.clone();
        assignment.write_annotations(&mut next.annotations);
        next
    }
}

/// Parses a comma-joined index list; repeats are dropped, first order kept.
fn parse_indices(raw: &str) -> Vec<DeviceIndex> {
    let mut indices: Vec<DeviceIndex> = Vec::new();
    for index in raw
        .split(',')
        .filter_map(|part| part.trim().parse::<DeviceIndex>().ok())
    {
        if !indices.contains(&index) {
            indices.push(index);
        }
    }
    indices
}

pub(crate) fn join_indices(indices: &[DeviceIndex]) -> String {
    indices
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_nanos(raw: &str) -> Option<DateTime<Utc>> {
    raw.trim().parse::<i64>().ok().map(|n| Utc.timestamp_nanos(n))
}

fn format_nanos(at: DateTime<Utc>) -> String {
    at.timestamp_nanos_opt().unwrap_or_default().to_string()
}

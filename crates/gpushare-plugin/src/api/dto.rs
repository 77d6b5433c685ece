use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::device::{DeviceHealth, DeviceIndex};
use crate::engine::AllocationRequest;
use crate::units::Units;

/// Allocation request from the host placement agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub container_requests: Vec<ContainerRequestDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRequestDto {
    pub units: Units,
}

impl AllocateRequest {
    pub fn into_request(self) -> AllocationRequest {
        AllocationRequest::new(self.container_requests.into_iter().map(|c| c.units))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateResponse {
    pub container_responses: Vec<ContainerResponseDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerResponseDto {
    pub envs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub index: DeviceIndex,
    pub capacity_units: Units,
    pub health: DeviceHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListDevicesResponse {
    pub unit: String,
    pub devices: Vec<DeviceDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthUpdateRequest {
    pub health: DeviceHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_name: String,
    pub devices: usize,
}

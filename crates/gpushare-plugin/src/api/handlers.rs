//! HTTP handlers for the placement agent and the health monitor.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};

use super::dto::{
    AllocateRequest, AllocateResponse, ContainerResponseDto, DeviceDescriptor, HealthResponse,
    HealthUpdateRequest, ListDevicesResponse,
};
use super::state::AppState;
use crate::error::PluginError;

pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_name: state.engine.node_name().to_string(),
        devices: state.registry().len(),
    })
}

/// Capacity listing: registry contents plus the last reported health.
pub async fn list_devices(State(state): State<AppState>) -> Json<ListDevicesResponse> {
    let registry = state.registry();
    let devices = registry
        .list_devices()
        .iter()
        .map(|device| DeviceDescriptor {
            id: device.handle.clone(),
            index: device.index,
            capacity_units: device.capacity_units,
            health: state.health.health_of(&device.handle),
        })
        .collect();

    Json(ListDevicesResponse {
        unit: registry.unit().to_string(),
        devices,
    })
}

/// Forwarded health report from the device monitor.
pub async fn update_device_health(
    State(state): State<AppState>,
    Path(handle): Path<String>,
    Json(update): Json<HealthUpdateRequest>,
) -> Result<Json<DeviceDescriptor>, PluginError> {
    let device = state
        .registry()
        .list_devices()
        .iter()
        .find(|d| d.handle == handle)
        .ok_or_else(|| PluginError::not_found("device", handle.clone()))?;

    state.health.report(&device.handle, update.health);

    Ok(Json(DeviceDescriptor {
        id: device.handle.clone(),
        index: device.index,
        capacity_units: device.capacity_units,
        health: update.health,
    }))
}

/// Always answers with one entry per requested container; failures are
/// encoded in the entries, never as an error status.
pub async fn allocate(
    State(state): State<AppState>,
    Json(body): Json<AllocateRequest>,
) -> Json<AllocateResponse> {
    let request = body.into_request();
    let decision = state.allocate(&request).await;

    let container_responses = decision
        .container_envs(&request, state.registry())
        .into_iter()
        .map(|envs| ContainerResponseDto { envs })
        .collect();

    Json(AllocateResponse {
        container_responses,
    })
}

//! Last known health of each device, as reported by the external monitor.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DeviceHealth {
    #[default]
    Healthy,
    Unhealthy,
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceHealth::Healthy => f.write_str("Healthy"),
            DeviceHealth::Unhealthy => f.write_str("Unhealthy"),
        }
    }
}

/// Health per device handle. Devices never reported on are healthy.
#[derive(Debug, Default)]
pub struct HealthBoard {
    states: DashMap<String, DeviceHealth>,
}

impl HealthBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn health_of(&self, handle: &str) -> DeviceHealth {
        self.states.get(handle).map(|s| *s).unwrap_or_default()
    }

    /// Records a report; returns the previous state.
    pub fn report(&self, handle: &str, health: DeviceHealth) -> DeviceHealth {
        let previous = self
            .states
            .insert(handle.to_string(), health)
            .unwrap_or_default();
        if previous != health {
            tracing::warn!(handle, from = %previous, to = %health, "Device health changed");
        }
        previous
    }
}

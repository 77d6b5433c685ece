//! Node-local device registry.
//!
//! The registry is built once at startup from a [`DeviceEnumerator`] and never
//! mutated afterwards, so it is shared behind an `Arc` and read without locks.

pub mod discovery;
pub mod health;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::error::RegistryError;
use crate::units::{MemoryUnit, Units};

pub use discovery::{DeviceEnumerator, EnumeratedDevice, StaticEnumerator};
#[cfg(feature = "nvidia-gpu")]
pub use discovery::NvmlEnumerator;
pub use health::{DeviceHealth, HealthBoard};

/// Stable numeric index of a device, assigned at registry build time.
pub type DeviceIndex = u32;

/// One physical accelerator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub index: DeviceIndex,
    /// Identifier handed to the container runtime (e.g. a GPU UUID)
    pub handle: String,
    pub capacity_units: Units,
}

/// Immutable table of the devices on this node
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    unit: MemoryUnit,
    devices: Vec<Device>,
    by_index: HashMap<DeviceIndex, usize>,
}

impl DeviceRegistry {
    /// Enumerates devices and quantizes their memory into `unit`s.
    ///
    /// Indices follow enumeration order. Devices smaller than one unit are
    /// skipped. Fails if nothing usable remains.
    pub fn build(enumerator: &dyn DeviceEnumerator, unit: MemoryUnit) -> Result<Self, RegistryError> {
        let enumerated = enumerator.enumerate()?;

        let mut devices = Vec::with_capacity(enumerated.len());
        for (position, found) in enumerated.into_iter().enumerate() {
            let capacity_units = unit.units_from_bytes(found.memory_bytes);
            if capacity_units == 0 {
                warn!(
                    handle = %found.handle,
                    memory_bytes = found.memory_bytes,
                    "Skipping device smaller than one {}", unit
                );
                continue;
            }
            devices.push(Device {
                index: position as DeviceIndex,
                handle: found.handle,
                capacity_units,
            });
        }

        let registry = Self::from_devices(unit, devices)?;
        info!(
            devices = registry.len(),
            unit = %unit,
            "Device registry built"
        );
        Ok(registry)
    }

    /// Builds a registry from already-quantized devices.
    pub fn from_devices(unit: MemoryUnit, devices: Vec<Device>) -> Result<Self, RegistryError> {
        if devices.is_empty() {
            return Err(RegistryError::NoDevices);
        }

        let by_index = devices
            .iter()
            .enumerate()
            .map(|(slot, device)| (device.index, slot))
            .collect();

        Ok(Self {
            unit,
            devices,
            by_index,
        })
    }

    /// All devices, in index order
    pub fn list_devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device_by_index(&self, index: DeviceIndex) -> Option<&Device> {
        self.by_index.get(&index).map(|&slot| &self.devices[slot])
    }

    pub fn unit(&self) -> MemoryUnit {
        self.unit
    }

    /// Capacity reported to the runtime for a single device. Nodes are
    /// expected to carry identical devices, so the first one is used.
    pub fn nominal_capacity(&self) -> Units {
        self.devices.first().map_or(0, |d| d.capacity_units)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

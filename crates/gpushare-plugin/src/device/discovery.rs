//! GPU enumeration sources consulted once at startup.

use crate::error::RegistryError;

/// A physical device as reported by an enumeration source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumeratedDevice {
    pub handle: String,
    pub memory_bytes: u64,
}

/// Source of the devices present on this node
pub trait DeviceEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<EnumeratedDevice>, RegistryError>;
}

/// Fixed device list, used on nodes without NVML and in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticEnumerator {
    devices: Vec<EnumeratedDevice>,
}

impl StaticEnumerator {
    pub fn new(devices: Vec<EnumeratedDevice>) -> Self {
        Self { devices }
    }

    /// Parses `handle=size[,handle=size...]` where size is bytes or carries a
    /// `GiB`/`MiB` suffix, e.g. `GPU-0=16GiB,GPU-1=16384MiB`.
    pub fn parse(spec: &str) -> Result<Self, RegistryError> {
        let invalid = |reason: &str| RegistryError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let mut devices = Vec::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (handle, size) = entry
                .split_once('=')
                .ok_or_else(|| invalid("expected handle=size"))?;
            let handle = handle.trim();
            if handle.is_empty() {
                return Err(invalid("empty device handle"));
            }
            let memory_bytes = parse_size(size.trim()).ok_or_else(|| invalid("bad size"))?;
            devices.push(EnumeratedDevice {
                handle: handle.to_string(),
                memory_bytes,
            });
        }

        Ok(Self { devices })
    }
}

impl DeviceEnumerator for StaticEnumerator {
    fn enumerate(&self) -> Result<Vec<EnumeratedDevice>, RegistryError> {
        Ok(self.devices.clone())
    }
}

fn parse_size(size: &str) -> Option<u64> {
    let (digits, multiplier) = if let Some(n) = size.strip_suffix("GiB") {
        (n, 1u64 << 30)
    } else if let Some(n) = size.strip_suffix("MiB") {
        (n, 1u64 << 20)
    } else {
        (size, 1)
    };
    digits.trim().parse::<u64>().ok()?.checked_mul(multiplier)
}

/// Enumerates NVIDIA GPUs through NVML
#[cfg(feature = "nvidia-gpu")]
#[derive(Debug, Default)]
pub struct NvmlEnumerator;

#[cfg(feature = "nvidia-gpu")]
impl DeviceEnumerator for NvmlEnumerator {
    fn enumerate(&self) -> Result<Vec<EnumeratedDevice>, RegistryError> {
        use nvml_wrapper::Nvml;

        let nvml = Nvml::init()
            .map_err(|e| RegistryError::Enumeration(format!("NVML init failed: {}", e)))?;

        let device_count = nvml.device_count().map_err(|e| {
            RegistryError::Enumeration(format!("Failed to get device count: {}", e))
        })?;

        let mut devices = Vec::with_capacity(device_count as usize);
        for i in 0..device_count {
            let device = nvml.device_by_index(i).map_err(|e| {
                RegistryError::Enumeration(format!("Failed to get device {}: {}", i, e))
            })?;

            let uuid = device.uuid().map_err(|e| {
                RegistryError::Enumeration(format!("Failed to get UUID of device {}: {}", i, e))
            })?;

            let memory_info = device.memory_info().map_err(|e| {
                RegistryError::Enumeration(format!("Failed to get memory info of device {}: {}", i, e))
            })?;

            devices.push(EnumeratedDevice {
                handle: uuid,
                memory_bytes: memory_info.total,
            });
        }

        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_static_device_list() {
        let enumerator = StaticEnumerator::parse("GPU-0=16GiB, GPU-1=16384MiB,GPU-2=1073741824").unwrap();
        let devices = enumerator.enumerate().unwrap();

        assert_eq!(devices.len(), 3);
        assert_eq!(devices[0].handle, "GPU-0");
        assert_eq!(devices[0].memory_bytes, 16 << 30);
        assert_eq!(devices[1].memory_bytes, 16 << 30);
        assert_eq!(devices[2].memory_bytes, 1 << 30);
    }

    #[test]
    fn test_parse_rejects_malformed_entries() {
        assert!(StaticEnumerator::parse("GPU-0").is_err());
        assert!(StaticEnumerator::parse("=16GiB").is_err());
        assert!(StaticEnumerator::parse("GPU-0=lots").is_err());
    }

    #[test]
    fn test_parse_empty_spec_yields_no_devices() {
        let devices = StaticEnumerator::parse("").unwrap().enumerate().unwrap();
        assert!(devices.is_empty());
    }
}

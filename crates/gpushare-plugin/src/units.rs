//! Quantization of GPU memory into fixed-size allocation units.
//!
//! All allocation arithmetic is done in whole units, never raw bytes, so that
//! comparisons between a workload's request and a device's capacity are exact.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PluginError;

/// A count of memory units.
pub type Units = u64;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Size of one allocation unit. Fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MemoryUnit {
    #[default]
    GiB,
    MiB,
}

impl MemoryUnit {
    /// Bytes in one unit
    #[must_use]
    pub fn bytes(self) -> u64 {
        match self {
            MemoryUnit::GiB => GIB,
            MemoryUnit::MiB => MIB,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryUnit::GiB => "GiB",
            MemoryUnit::MiB => "MiB",
        }
    }

    /// Whole units contained in `bytes`, rounded down.
    #[must_use]
    pub fn units_from_bytes(self, bytes: u64) -> Units {
        bytes / self.bytes()
    }

    /// Parses a configured unit, falling back to the default on anything
    /// unrecognized.
    pub fn parse_or_default(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!(
                "Unsupported memory unit: {}, using {} as default",
                value,
                MemoryUnit::default()
            );
            MemoryUnit::default()
        })
    }
}

impl FromStr for MemoryUnit {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "GiB" => Ok(MemoryUnit::GiB),
            "MiB" => Ok(MemoryUnit::MiB),
            other => Err(PluginError::invalid_input(
                "memory_unit",
                format!("'{other}' is not one of GiB, MiB"),
            )),
        }
    }
}

impl fmt::Display for MemoryUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

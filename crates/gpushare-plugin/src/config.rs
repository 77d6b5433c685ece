use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::store::KubeStoreConfig;
use crate::units::MemoryUnit;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node_name: String,
    pub memory_unit: MemoryUnit,
    pub server: ServerSettings,
    pub devices: DeviceSettings,
    pub store: KubeStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceSettings {
    /// Static `handle=size` list; NVML is used when absent
    pub static_devices: Option<String>,
}

impl Config {
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let api_url = var("KUBERNETES_API_URL").unwrap_or_else(|| {
            let host = var("KUBERNETES_SERVICE_HOST").unwrap_or_else(|| "kubernetes.default.svc".to_string());
            let port = var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|| "443".to_string());
            format!("https://{host}:{port}")
        });

        Ok(Self {
            node_name: var("NODE_NAME").or_else(|| var("HOSTNAME")).unwrap_or_default(),
            memory_unit: var("GPUSHARE_MEMORY_UNIT")
                .map(|v| MemoryUnit::parse_or_default(&v))
                .unwrap_or_default(),
            server: ServerSettings {
                bind_addr: var("GPUSHARE_BIND_ADDR").unwrap_or_else(|| "127.0.0.1:7460".to_string()),
            },
            devices: DeviceSettings {
                static_devices: var("GPUSHARE_DEVICES"),
            },
            store: KubeStoreConfig {
                api_url,
                token_path: Some(
                    var("KUBERNETES_TOKEN_PATH")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from(SERVICE_ACCOUNT_DIR).join("token")),
                ),
                ca_path: Some(
                    var("KUBERNETES_CA_PATH")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from(SERVICE_ACCOUNT_DIR).join("ca.crt")),
                ),
                timeout_secs: var("GPUSHARE_STORE_TIMEOUT_SECS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
                accept_invalid_certs: var("GPUSHARE_STORE_INSECURE")
                    .map(|s| matches!(s.trim(), "1" | "true" | "yes"))
                    .unwrap_or(false),
            },
        })
    }

    /// Rejects settings the plugin cannot start with.
    pub fn validate(&self) -> crate::Result<()> {
        if self.node_name.trim().is_empty() {
            return Err(crate::PluginError::config(
                "node name is not set (NODE_NAME or --node-name)",
            ));
        }
        if self.store.timeout_secs == 0 {
            return Err(crate::PluginError::config(
                "GPUSHARE_STORE_TIMEOUT_SECS must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store.timeout_secs)
    }
}

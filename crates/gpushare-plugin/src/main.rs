use clap::Parser;
use gpushare_plugin::{
    api::{start_server, AppState, ServerConfig},
    device::{DeviceEnumerator, DeviceRegistry, StaticEnumerator},
    store::KubeStore,
    Config, MemoryUnit, PluginError,
};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "gpushare-plugin")]
#[command(about = "Binds shared-GPU-memory workloads to devices on this node", long_about = None)]
#[command(version)]
struct Cli {
    /// Name of the node this plugin runs on
    #[arg(long, env = "NODE_NAME")]
    node_name: Option<String>,

    /// Memory unit: GiB or MiB
    #[arg(long)]
    memory_unit: Option<String>,

    /// Local address for the allocation endpoint
    #[arg(long)]
    bind: Option<String>,

    /// Static device list (`handle=size,...`) instead of NVML
    #[arg(long)]
    devices: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug {
        "gpushare_plugin=debug,tower_http=debug"
    } else {
        "gpushare_plugin=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting GPU share plugin v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::from_env()?;
    if let Some(node_name) = cli.node_name {
        config.node_name = node_name;
    }
    if let Some(unit) = cli.memory_unit.as_deref() {
        config.memory_unit = MemoryUnit::parse_or_default(unit);
    }
    if let Some(bind) = cli.bind {
        config.server.bind_addr = bind;
    }
    if cli.devices.is_some() {
        config.devices.static_devices = cli.devices;
    }
    config.validate()?;

    tracing::info!(
        "Configuration loaded - Node: {}, Unit: {}, Bind: {}, Store: {}",
        config.node_name,
        config.memory_unit,
        config.server.bind_addr,
        config.store.api_url
    );

    let registry = match build_registry(&config) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!("Failed to build device registry: {}", e);
            return Err(e.into());
        }
    };
    for device in registry.list_devices() {
        tracing::info!(
            index = device.index,
            handle = %device.handle,
            capacity_units = device.capacity_units,
            "Registered device"
        );
    }

    let store = Arc::new(KubeStore::new(&config.store)?);
    let state = AppState::with_store(
        config.node_name.clone(),
        registry,
        store,
        config.store_timeout(),
    );

    let server_config = ServerConfig {
        bind_addr: config.server.bind_addr.clone(),
    };
    start_server(state, server_config, shutdown_signal()).await?;

    tracing::info!("GPU share plugin stopped");
    Ok(())
}

fn build_registry(config: &Config) -> Result<DeviceRegistry, PluginError> {
    let enumerator = enumerator(config)?;
    Ok(DeviceRegistry::build(enumerator.as_ref(), config.memory_unit)?)
}

fn enumerator(config: &Config) -> Result<Box<dyn DeviceEnumerator>, PluginError> {
    if let Some(spec) = config.devices.static_devices.as_deref() {
        tracing::info!("Using static device list");
        return Ok(Box::new(StaticEnumerator::parse(spec)?));
    }

    hardware_enumerator()
}

#[cfg(feature = "nvidia-gpu")]
fn hardware_enumerator() -> Result<Box<dyn DeviceEnumerator>, PluginError> {
    tracing::info!("Enumerating devices through NVML");
    Ok(Box::new(gpushare_plugin::device::NvmlEnumerator))
}

#[cfg(not(feature = "nvidia-gpu"))]
fn hardware_enumerator() -> Result<Box<dyn DeviceEnumerator>, PluginError> {
    Err(PluginError::config(
        "no device source: set GPUSHARE_DEVICES or build with the nvidia-gpu feature",
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

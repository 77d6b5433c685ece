use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::device::{DeviceRegistry, HealthBoard};
use crate::engine::{AllocationDecision, AllocationEngine, AllocationRequest};
use crate::resolver::CandidateResolver;
use crate::store::WorkloadStore;
use crate::writer::AssignmentWriter;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AllocationEngine>,
    pub health: Arc<HealthBoard>,
    /// Node-wide allocation lock; held for a whole `allocate` call
    allocation_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(engine: AllocationEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            health: Arc::new(HealthBoard::new()),
            allocation_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Wires the engine, resolver and writer over one store.
    pub fn with_store(
        node_name: impl Into<String>,
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn WorkloadStore>,
        store_timeout: Duration,
    ) -> Self {
        let resolver = CandidateResolver::new(store.clone(), store_timeout);
        let writer = AssignmentWriter::new(store, store_timeout);
        Self::new(AllocationEngine::new(node_name, registry, resolver, writer))
    }

    pub fn registry(&self) -> &DeviceRegistry {
        self.engine.registry()
    }

    /// Runs one allocation under the node-wide lock. The guard is released
    /// when this returns, on every path.
    pub async fn allocate(&self, request: &AllocationRequest) -> AllocationDecision {
        let _guard = self.allocation_lock.lock().await;
        self.engine.allocate(request).await
    }
}

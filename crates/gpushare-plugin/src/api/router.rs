//! HTTP router for the plugin's local endpoint.

use axum::{
    routing::{get, post, put},
    Router,
};
use std::future::Future;
use tower_http::trace::TraceLayer;

use super::{handlers, state::AppState};

/// Create the router.
///
/// # Routes
///
/// - `GET /health` - Service health
/// - `GET /api/v1/devices` - Capacity listing
/// - `PUT /api/v1/devices/:handle/health` - Health report from the monitor
/// - `POST /api/v1/allocate` - Allocation request
pub fn create_router(state: AppState) -> Router {
    let api_v1 = Router::new()
        .route("/devices", get(handlers::list_devices))
        .route("/devices/:handle/health", put(handlers::update_device_health))
        .route("/allocate", post(handlers::allocate));

    Router::new()
        .route("/health", get(handlers::health_handler))
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind to
    pub bind_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7460".to_string(),
        }
    }
}

/// Serve until `shutdown` resolves.
pub async fn start_server<F>(
    state: AppState,
    config: ServerConfig,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_router(state);

    tracing::info!("Starting GPU share plugin API on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

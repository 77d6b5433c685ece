//! Local HTTP API consumed by the host placement agent.
//!
//! # API Endpoints
//!
//! - `GET /health` - Returns health status
//! - `GET /api/v1/devices` - Lists devices with capacity and health
//! - `PUT /api/v1/devices/:handle/health` - Records a health report
//! - `POST /api/v1/allocate` - Binds a workload and returns per-container
//!   runtime parameters
//!
//! Allocation always answers `200 OK`; an unsatisfiable or failed request
//! yields sentinel parameters instead of an error status.

pub mod dto;
pub mod handlers;
pub mod router;
pub mod state;

pub use router::{create_router, start_server, ServerConfig};
pub use state::AppState;

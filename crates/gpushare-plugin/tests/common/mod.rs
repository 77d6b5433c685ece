#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::{DateTime, TimeZone, Utc};
use gpushare_plugin::api::{create_router, AppState};
use gpushare_plugin::store::InMemoryStore;
use gpushare_plugin::{Device, DeviceRegistry, MemoryUnit, Workload};
use http_body_util::BodyExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub const NODE: &str = "node-a";

pub struct TestApp {
    pub store: Arc<InMemoryStore>,
    pub state: AppState,
}

impl TestApp {
    /// `device_count` devices of `capacity` GiB each
    pub fn new(device_count: u32, capacity: u64) -> Self {
        Self::with_timeout(device_count, capacity, Duration::from_secs(1))
    }

    pub fn with_timeout(device_count: u32, capacity: u64, timeout: Duration) -> Self {
        let devices = (0..device_count)
            .map(|i| Device {
                index: i,
                handle: format!("GPU-{i}"),
                capacity_units: capacity,
            })
            .collect();
        let registry = Arc::new(
            DeviceRegistry::from_devices(MemoryUnit::GiB, devices)
                .expect("Failed to build registry"),
        );

        let store = Arc::new(InMemoryStore::new());
        let state = AppState::with_store(NODE, registry, store.clone(), timeout);
        Self { store, state }
    }

    pub fn router(&self) -> axum::Router {
        create_router(self.state.clone())
    }

    pub async fn allocate(&self, container_units: &[u64]) -> Vec<Value> {
        let body = serde_json::json!({
            "container_requests": container_units
                .iter()
                .map(|units| serde_json::json!({ "units": units }))
                .collect::<Vec<_>>(),
        });

        let (status, json) = send(
            self.router(),
            Request::builder()
                .method("POST")
                .uri("/api/v1/allocate")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        json["container_responses"]
            .as_array()
            .expect("container_responses array")
            .iter()
            .map(|entry| entry["envs"].clone())
            .collect()
    }
}

pub async fn send(router: axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn candidate(name: &str, units: u64, assumed: i64) -> Workload {
    Workload::new("default", name, NODE)
        .with_requested_units(units)
        .with_assume_time(at(assumed))
}

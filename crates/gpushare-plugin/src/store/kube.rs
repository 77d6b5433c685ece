//! Workload store backed by the Kubernetes API server.
//!
//! Pods are the workloads. Conditional updates are JSON merge patches that
//! carry `metadata.resourceVersion`; the API server answers 409 when the
//! version is stale.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::{StoreResult, WorkloadStore};
use crate::error::StoreError;
use crate::units::Units;
use crate::workload::{annotations, Workload, WorkloadId};

const MERGE_PATCH: &str = "application/merge-patch+json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeStoreConfig {
    /// API server base URL, e.g. `https://10.96.0.1:443`
    pub api_url: String,
    /// Bearer token file; skipped if it does not exist
    pub token_path: Option<PathBuf>,
    /// Cluster CA bundle; skipped if it does not exist
    pub ca_path: Option<PathBuf>,
    pub timeout_secs: u64,
    pub accept_invalid_certs: bool,
}

/// Client for pod metadata on the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl KubeStore {
    pub fn new(config: &KubeStoreConfig) -> StoreResult<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(ca_path) = config.ca_path.as_ref().filter(|p| p.exists()) {
            let pem = std::fs::read(ca_path)
                .map_err(|e| StoreError::Unavailable(format!("reading {}: {e}", ca_path.display())))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        let token = match config.token_path.as_ref().filter(|p| p.exists()) {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(|e| StoreError::Unavailable(format!("reading {}: {e}", path.display())))?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        Ok(Self {
            client: builder.build()?,
            base_url: config.api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn pod_url(&self, id: &WorkloadId) -> String {
        format!(
            "{}/api/v1/namespaces/{}/pods/{}",
            self.base_url, id.namespace, id.name
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

async fn check_status(response: Response, id: &str) -> StoreResult<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound(id.to_string())),
        StatusCode::CONFLICT => Err(StoreError::Conflict(id.to_string())),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(StoreError::Unavailable(format!(
                "API server returned status {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl WorkloadStore for KubeStore {
    async fn get(&self, id: &WorkloadId) -> StoreResult<Workload> {
        let response = self.authorized(self.client.get(self.pod_url(id))).send().await?;
        let pod: Pod = check_status(response, &id.to_string()).await?.json().await?;
        Ok(pod.into_workload())
    }

    async fn list_on_node(&self, node_name: &str) -> StoreResult<Vec<Workload>> {
        let url = format!("{}/api/v1/pods", self.base_url);
        let selector = format!("spec.nodeName={node_name}");
        let response = self
            .authorized(self.client.get(&url).query(&[("fieldSelector", selector.as_str())]))
            .send()
            .await?;
        let list: PodList = check_status(response, node_name).await?.json().await?;

        let total = list.items.len();
        let workloads: Vec<Workload> = list
            .items
            .into_iter()
            .filter(|pod| !pod.is_terminated())
            .map(Pod::into_workload)
            .filter(|w| w.requested().is_some())
            .collect();
        debug!(node = node_name, total, sharing = workloads.len(), "Listed pods on node");
        Ok(workloads)
    }

    async fn update(&self, workload: &Workload) -> StoreResult<Workload> {
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": workload.resource_version,
                "annotations": workload.annotations,
            }
        });

        let response = self
            .authorized(self.client.patch(self.pod_url(&workload.id)))
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(serde_json::to_vec(&patch)?)
            .send()
            .await?;
        let pod: Pod = check_status(response, &workload.id.to_string())
            .await?
            .json()
            .await?;
        Ok(pod.into_workload())
    }
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: PodSpec,
    #[serde(default)]
    status: PodStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
    #[serde(default)]
    resource_version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodSpec {
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Default, Deserialize)]
struct Container {
    #[serde(default)]
    resources: ResourceRequirements,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceRequirements {
    #[serde(default)]
    limits: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PodStatus {
    #[serde(default)]
    phase: Option<String>,
}

impl Pod {
    fn is_terminated(&self) -> bool {
        matches!(self.status.phase.as_deref(), Some("Succeeded") | Some("Failed"))
    }

    /// Sum of the shared-memory limit across containers; `None` if no
    /// container declares it.
    /// Overflowing totals are treated as no request.
    fn requested_units(&self) -> Option<Units> {
        let declared: Vec<Units> = self
            .spec
            .containers
            .iter()
            .filter_map(|c| c.resources.limits.get(annotations::RESOURCE_NAME))
            .filter_map(quantity_units)
            .collect();
        if declared.is_empty() {
            return None;
        }
        declared.into_iter().try_fold(0, Units::checked_add)
    }

    fn into_workload(self) -> Workload {
        let requested_units = self.requested_units();
        Workload {
            id: WorkloadId::new(self.metadata.namespace, self.metadata.name),
            node_name: self.spec.node_name.unwrap_or_default(),
            requested_units,
            container_count: self.spec.containers.len(),
            annotations: self.metadata.annotations,
            resource_version: self.metadata.resource_version,
        }
    }
}

/// Extended-resource quantities are plain integers, serialized as strings.
fn quantity_units(value: &serde_json::Value) -> Option<Units> {
    match value {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

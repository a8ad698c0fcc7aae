//! Local model cache configuration
//!
//! Read once at startup from the `localModel` key of the
//! `lattice-local-model-config` ConfigMap and handed to every controller
//! context as a plain value.

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ReconcileError;

/// Name of the ConfigMap holding the local model configuration
pub const LOCAL_MODEL_CONFIG_MAP: &str = "lattice-local-model-config";

/// ConfigMap key holding the JSON document
pub const LOCAL_MODEL_CONFIG_KEY: &str = "localModel";

/// Default namespace for cluster-scoped download jobs and volumes
pub const DEFAULT_JOB_NAMESPACE: &str = "lattice-local-model-jobs";

/// Default downloader image when no storage container matches
pub const DEFAULT_JOB_IMAGE: &str = "ghcr.io/lattice-cloud/model-loader:v1";

/// Default agent image deployed onto node groups
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/lattice-cloud/lattice-model-cache:latest";

/// Settings shared by the cache controllers, the node-group deployer and the
/// node agent
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalModelConfig {
    /// Namespace for cluster-scoped download jobs and download PVCs
    pub job_namespace: String,

    /// Downloader image used when no storage container matches the URI
    pub default_job_image: String,

    /// fsGroup for download job pods
    pub fs_group: Option<i64>,

    /// TTL applied to finished download jobs
    pub job_ttl_seconds_after_finished: i32,

    /// How often the node agent re-reconciles its node
    pub reconciliation_frequency_secs: u64,

    /// Skip download/serving volume management in the cache controllers
    pub disable_volume_management: bool,

    /// Node agent image
    pub agent_image: String,

    /// Node agent image pull policy
    pub agent_image_pull_policy: String,

    /// Node agent CPU request
    pub agent_cpu_request: String,

    /// Node agent CPU limit
    pub agent_cpu_limit: String,

    /// Node agent memory request
    pub agent_memory_request: String,

    /// Node agent memory limit
    pub agent_memory_limit: String,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            job_namespace: DEFAULT_JOB_NAMESPACE.to_string(),
            default_job_image: DEFAULT_JOB_IMAGE.to_string(),
            fs_group: Some(1000),
            job_ttl_seconds_after_finished: 3600,
            reconciliation_frequency_secs: 60,
            disable_volume_management: false,
            agent_image: DEFAULT_AGENT_IMAGE.to_string(),
            agent_image_pull_policy: "IfNotPresent".to_string(),
            agent_cpu_request: "100m".to_string(),
            agent_cpu_limit: "100m".to_string(),
            agent_memory_request: "200Mi".to_string(),
            agent_memory_limit: "300Mi".to_string(),
        }
    }
}

impl LocalModelConfig {
    /// Parse the configuration out of a ConfigMap
    ///
    /// A missing key yields defaults; malformed JSON is an error.
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self, ReconcileError> {
        match cm.data.as_ref().and_then(|d| d.get(LOCAL_MODEL_CONFIG_KEY)) {
            Some(raw) => Self::from_json(raw),
            None => Ok(Self::default()),
        }
    }

    /// Parse the configuration from its JSON form
    pub fn from_json(raw: &str) -> Result<Self, ReconcileError> {
        serde_json::from_str(raw).map_err(|e| {
            ReconcileError::Config(format!(
                "invalid {} configuration: {}",
                LOCAL_MODEL_CONFIG_KEY, e
            ))
        })
    }

    /// Load the configuration from the cluster
    ///
    /// A missing ConfigMap yields defaults.
    pub async fn load(
        client: &Client,
        namespace: &str,
        config_map: &str,
    ) -> Result<Self, ReconcileError> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api
            .get_opt(config_map)
            .await
            .map_err(|e| ReconcileError::kube("failed to read local model config", e))?;
        match cm {
            Some(cm) => Self::from_config_map(&cm),
            None => {
                info!(
                    namespace = %namespace,
                    config_map = %config_map,
                    "Local model ConfigMap not found, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Agent resync interval
    pub fn reconciliation_frequency(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reconciliation_frequency_secs.max(1))
    }
}

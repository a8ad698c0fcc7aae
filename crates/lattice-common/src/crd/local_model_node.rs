//! LocalModelNode CRD types
//!
//! One `LocalModelNode` exists per Kubernetes node that hosts cached models.
//! The cache controllers write `spec.localModels`; the node agent reports
//! `status.modelStatus`.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::local_model_cache::{LocalModelStorageSpec, NodeStatus};

/// Download state of one model on one node
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ModelDownloadStatus {
    /// No job has made progress yet
    #[default]
    Pending,
    /// A download job is running
    Downloading,
    /// The model folder is complete on disk
    Downloaded,
    /// The most recent download job failed
    Error,
}

impl From<ModelDownloadStatus> for NodeStatus {
    fn from(status: ModelDownloadStatus) -> Self {
        match status {
            ModelDownloadStatus::Pending => NodeStatus::DownloadPending,
            ModelDownloadStatus::Downloading => NodeStatus::Downloading,
            ModelDownloadStatus::Downloaded => NodeStatus::Downloaded,
            ModelDownloadStatus::Error => NodeStatus::DownloadError,
        }
    }
}

/// A model that should be present on the node
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelInfo {
    /// Name of the cache that requested the model
    pub model_name: String,

    /// Namespace of a namespace-scoped cache; empty for cluster-scoped caches
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Where the model is downloaded from
    pub source_model_uri: String,

    /// Service account the download job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Storage credentials/overrides for the download job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<LocalModelStorageSpec>,
}

impl LocalModelInfo {
    /// Key used in `status.modelStatus`
    pub fn status_key(&self) -> String {
        model_status_key(&self.namespace, &self.model_name)
    }

    /// Folder name under the node's model root
    pub fn folder_name(&self) -> String {
        model_folder_name(&self.namespace, &self.model_name)
    }

    /// Download PVC of this model for a node group
    pub fn download_pvc_name(&self, group: &str) -> String {
        download_pvc_name(&self.namespace, &self.model_name, group)
    }

    /// True when the entry belongs to a namespace-scoped cache
    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }

    /// True when `other` carries the same identity (name + namespace)
    pub fn same_model(&self, other: &LocalModelInfo) -> bool {
        self.model_name == other.model_name && self.namespace == other.namespace
    }
}

/// Status key for a model: `name` or `namespace/name`
pub fn model_status_key(namespace: &str, model_name: &str) -> String {
    if namespace.is_empty() {
        model_name.to_string()
    } else {
        format!("{}/{}", namespace, model_name)
    }
}

/// On-disk folder for a model: `name` or `namespace_name`
///
/// `_` is not legal in Kubernetes object names, so cluster and namespaced
/// folders never collide.
pub fn model_folder_name(namespace: &str, model_name: &str) -> String {
    if namespace.is_empty() {
        model_name.to_string()
    } else {
        format!("{}_{}", namespace, model_name)
    }
}

/// Download PVC name for a model and node group
///
/// Namespace-scoped models get a `-download` suffix so the claim never clashes
/// with the serving claim the same cache creates in its own namespace.
pub fn download_pvc_name(namespace: &str, model_name: &str, group: &str) -> String {
    if namespace.is_empty() {
        format!("{}-{}", model_name, group)
    } else {
        format!("{}-{}-download", model_name, group)
    }
}

/// Models assigned to a single node
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "LocalModelNode",
    plural = "localmodelnodes",
    shortname = "lmn",
    status = "LocalModelNodeStatus",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelNodeSpec {
    /// Models that should be present on this node
    #[serde(default)]
    pub local_models: Vec<LocalModelInfo>,
}

/// Agent-reported download state
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelNodeStatus {
    /// Download state keyed by [`model_status_key`]
    #[serde(default)]
    pub model_status: BTreeMap<String, ModelDownloadStatus>,
}

impl LocalModelNode {
    /// Reported state of a model, if the agent has reported one
    pub fn model_status(&self, key: &str) -> Option<ModelDownloadStatus> {
        self.status
            .as_ref()
            .and_then(|s| s.model_status.get(key).copied())
    }
}

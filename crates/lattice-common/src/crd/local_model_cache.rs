//! LocalModelCache and LocalModelNamespaceCache CRD types
//!
//! Both kinds declare "this model should be pre-downloaded onto every node of
//! these node groups". They differ only in scope: `LocalModelCache` is
//! cluster-scoped and serves workloads in any namespace, while
//! `LocalModelNamespaceCache` serves workloads in its own namespace.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

// =============================================================================
// Shared spec pieces
// =============================================================================

/// Storage credentials and overrides passed to the download job
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelStorageSpec {
    /// Key of the storage secret entry to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Free-form storage parameters (bucket, region, endpoint...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<BTreeMap<String, String>>,
}

/// Per-node download state reported on a cache
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeStatus {
    /// The node is not ready; nothing is dispatched to it
    NotReady,
    /// The node agent has not reported progress yet
    #[default]
    DownloadPending,
    /// A download job is running
    Downloading,
    /// The last download job failed
    DownloadError,
    /// The model is on the node's disk
    Downloaded,
}

/// Aggregated copy counts across all nodes of a cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelCopies {
    /// Number of nodes tracked in `nodeStatus`
    pub total: i32,
    /// Nodes where the model is downloaded
    pub available: i32,
    /// Nodes where the download failed
    pub failed: i32,
}

/// Reference to a consuming workload
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
pub struct NamespacedName {
    /// Workload name
    pub name: String,
    /// Workload namespace
    pub namespace: String,
}

/// Status shared by both cache kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelCacheStatus {
    /// Download state keyed by node name
    #[serde(default)]
    pub node_status: BTreeMap<String, NodeStatus>,

    /// Aggregated copy counts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copies: Option<ModelCopies>,

    /// Workloads currently consuming this cache
    #[serde(default)]
    pub inference_services: Vec<NamespacedName>,
}

/// Checks shared by both cache specs
fn validate_source(source_model_uri: &str, node_groups: &[String]) -> Result<(), ReconcileError> {
    if source_model_uri.trim().is_empty() {
        return Err(ReconcileError::Validation(
            "sourceModelUri cannot be empty".to_string(),
        ));
    }
    if !source_model_uri.contains("://") {
        return Err(ReconcileError::Validation(format!(
            "sourceModelUri '{}' must include a scheme (e.g. s3://, gs://, hf://)",
            source_model_uri
        )));
    }
    if node_groups.is_empty() {
        return Err(ReconcileError::Validation(
            "nodeGroups must name at least one node group".to_string(),
        ));
    }
    for group in node_groups {
        if !is_dns_label(group) {
            return Err(ReconcileError::Validation(format!(
                "node group name '{}' is not a valid DNS label",
                group
            )));
        }
    }
    Ok(())
}

fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

// =============================================================================
// LocalModelCache (cluster-scoped)
// =============================================================================

/// Cluster-scoped model cache
///
/// The first entry in `nodeGroups` is the default group for workloads that do
/// not request one explicitly.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "LocalModelCache",
    plural = "localmodelcaches",
    shortname = "lmc",
    status = "LocalModelCacheStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.sourceModelUri"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.copies.available"}"#,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.copies.total"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelCacheSpec {
    /// Where the model is downloaded from (e.g. `s3://bucket/llama`)
    pub source_model_uri: String,

    /// Node groups the model is cached on; the first is the default
    pub node_groups: Vec<String>,

    /// Service account the download job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Storage credentials/overrides for the download job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<LocalModelStorageSpec>,
}

impl LocalModelCacheSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), ReconcileError> {
        validate_source(&self.source_model_uri, &self.node_groups)
    }
}

// =============================================================================
// LocalModelNamespaceCache (namespaced)
// =============================================================================

/// Namespace-scoped model cache
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "LocalModelNamespaceCache",
    plural = "localmodelnamespacecaches",
    shortname = "lmnc",
    namespaced,
    status = "LocalModelCacheStatus",
    printcolumn = r#"{"name":"Model","type":"string","jsonPath":".spec.sourceModelUri"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.copies.available"}"#,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.copies.total"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelNamespaceCacheSpec {
    /// Where the model is downloaded from
    pub source_model_uri: String,

    /// Node groups the model is cached on; the first is the default
    pub node_groups: Vec<String>,

    /// Service account the download job runs as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Storage credentials/overrides for the download job
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<LocalModelStorageSpec>,
}

impl LocalModelNamespaceCacheSpec {
    /// Validate the spec
    pub fn validate(&self) -> Result<(), ReconcileError> {
        validate_source(&self.source_model_uri, &self.node_groups)
    }
}

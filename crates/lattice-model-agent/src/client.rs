//! Kubernetes access for the node agent

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams, PropagationPolicy};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use lattice_common::crd::{
    ClusterStorageContainer, LocalModelNode, LocalModelNodeGroup, ModelDownloadStatus,
};
use lattice_common::error::{is_conflict, is_not_found};
use lattice_common::ReconcileError;

/// Field manager for status patches issued by the agent
pub const FIELD_MANAGER: &str = "lattice-model-agent";

/// Trait abstracting Kubernetes operations used by the node agent
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AgentKube: Send + Sync {
    /// Get a Node by name
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ReconcileError>;

    /// List all node groups
    async fn list_node_groups(&self) -> Result<Vec<LocalModelNodeGroup>, ReconcileError>;

    /// List all storage containers (none when the CRD is absent)
    async fn list_storage_containers(&self)
        -> Result<Vec<ClusterStorageContainer>, ReconcileError>;

    /// List jobs in every namespace matching a label selector
    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>, ReconcileError>;

    /// Create a job (already existing is fine)
    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ReconcileError>;

    /// Delete a job and its pods (absent is fine)
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ReconcileError>;

    /// Replace `status.modelStatus` of a LocalModelNode
    async fn patch_model_status(
        &self,
        name: &str,
        previous: &BTreeMap<String, ModelDownloadStatus>,
        current: &BTreeMap<String, ModelDownloadStatus>,
    ) -> Result<(), ReconcileError>;
}

/// Merge patch turning `previous` into `current`
///
/// Keys missing from `current` are nulled so the API server drops them.
pub fn model_status_patch(
    previous: &BTreeMap<String, ModelDownloadStatus>,
    current: &BTreeMap<String, ModelDownloadStatus>,
) -> Value {
    let mut entries = Map::new();
    for key in previous.keys().filter(|k| !current.contains_key(*k)) {
        entries.insert(key.clone(), Value::Null);
    }
    for (key, status) in current {
        entries.insert(key.clone(), json!(status));
    }
    json!({ "status": { "modelStatus": entries } })
}

/// Real Kubernetes client implementation
pub struct AgentKubeImpl {
    client: Client,
}

impl AgentKubeImpl {
    /// Create a new AgentKubeImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AgentKube for AgentKubeImpl {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ReconcileError> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| ReconcileError::kube(format!("failed to get node {}", name), e))
    }

    async fn list_node_groups(&self) -> Result<Vec<LocalModelNodeGroup>, ReconcileError> {
        let api: Api<LocalModelNodeGroup> = Api::all(self.client.clone());
        let groups = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ReconcileError::kube("failed to list node groups", e))?;
        Ok(groups.items)
    }

    async fn list_storage_containers(
        &self,
    ) -> Result<Vec<ClusterStorageContainer>, ReconcileError> {
        let api: Api<ClusterStorageContainer> = Api::all(self.client.clone());
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items),
            Err(e) if is_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(ReconcileError::kube("failed to list storage containers", e)),
        }
    }

    async fn list_jobs(&self, selector: &str) -> Result<Vec<Job>, ReconcileError> {
        let api: Api<Job> = Api::all(self.client.clone());
        let jobs = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| ReconcileError::kube("failed to list download jobs", e))?;
        Ok(jobs.items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<(), ReconcileError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(job = %job.name_any(), namespace = %namespace, "Job already exists");
                Ok(())
            }
            Err(e) => Err(ReconcileError::kube(
                format!("failed to create job {}/{}", namespace, job.name_any()),
                e,
            )),
        }
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match api.delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(job = %name, namespace = %namespace, "Job not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(ReconcileError::kube(
                format!("failed to delete job {}/{}", namespace, name),
                e,
            )),
        }
    }

    async fn patch_model_status(
        &self,
        name: &str,
        previous: &BTreeMap<String, ModelDownloadStatus>,
        current: &BTreeMap<String, ModelDownloadStatus>,
    ) -> Result<(), ReconcileError> {
        let api: Api<LocalModelNode> = Api::all(self.client.clone());
        let patch = model_status_patch(previous, current);
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                ReconcileError::kube(format!("failed to update LocalModelNode {} status", name), e)
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_patch_nulls_dropped_models() {
        let previous = BTreeMap::from([
            ("iris".to_string(), ModelDownloadStatus::Downloaded),
            ("team-a/bert".to_string(), ModelDownloadStatus::Error),
        ]);
        let current = BTreeMap::from([("iris".to_string(), ModelDownloadStatus::Downloaded)]);

        let patch = model_status_patch(&previous, &current);
        let entries = &patch["status"]["modelStatus"];
        assert_eq!(entries["iris"], "Downloaded");
        assert!(entries["team-a/bert"].is_null());
        assert_eq!(entries.as_object().unwrap().len(), 2);
    }

    #[test]
    fn status_patch_from_empty() {
        let current = BTreeMap::from([("iris".to_string(), ModelDownloadStatus::Pending)]);
        let patch = model_status_patch(&BTreeMap::new(), &current);
        assert_eq!(patch["status"]["modelStatus"]["iris"], "Pending");
    }
}

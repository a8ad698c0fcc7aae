//! Kubernetes access for the cache controllers
//!
//! The engine talks to the API server only through [`CacheKube`], so the
//! whole state machine can be driven by `MockCacheKube` in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use lattice_common::crd::{
    LocalModelCache, LocalModelCacheStatus, LocalModelInfo, LocalModelNamespaceCache,
    LocalModelNode, LocalModelNodeGroup,
};
use lattice_common::error::{is_conflict, is_not_found};
use lattice_common::kube_utils::inference_service_resource;
use lattice_common::{ReconcileError, LOCAL_MODEL_NODE_GROUP_ANNOTATION};

use crate::scope::{CacheKind, CacheScope};

/// Field manager for patches issued by the cache controllers
pub const FIELD_MANAGER: &str = "lattice-model-cache";

/// An inference workload that consumes a cache
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerWorkload {
    /// Workload name
    pub name: String,
    /// Workload namespace
    pub namespace: String,
    /// Node group requested through the node-group annotation
    pub node_group: Option<String>,
}

impl ConsumerWorkload {
    /// Extract the consumer view of a dynamic workload object
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        Self {
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            node_group: obj
                .annotations()
                .get(LOCAL_MODEL_NODE_GROUP_ANNOTATION)
                .filter(|g| !g.is_empty())
                .cloned(),
        }
    }
}

/// Trait abstracting Kubernetes operations used by the cache engine
///
/// Gets return `Option`; not-found is never an error. Deletes treat 404 as
/// success.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CacheKube: Send + Sync {
    /// Add the scope's finalizer with an optimistic patch
    async fn add_finalizer(&self, scope: &CacheScope) -> Result<(), ReconcileError>;

    /// Remove the scope's finalizer with an optimistic patch
    async fn remove_finalizer(&self, scope: &CacheScope) -> Result<(), ReconcileError>;

    /// Merge-patch the cache status from `previous` to `status`
    async fn patch_cache_status(
        &self,
        scope: &CacheScope,
        previous: &LocalModelCacheStatus,
        status: &LocalModelCacheStatus,
    ) -> Result<(), ReconcileError>;

    /// Get a node group by name
    async fn get_node_group(&self, name: &str)
        -> Result<Option<LocalModelNodeGroup>, ReconcileError>;

    /// List all cluster nodes
    async fn list_nodes(&self) -> Result<Vec<Node>, ReconcileError>;

    /// Get a per-node resource by node name
    async fn get_local_model_node(&self, name: &str)
        -> Result<Option<LocalModelNode>, ReconcileError>;

    /// Create a per-node resource
    async fn create_local_model_node(
        &self,
        node: &LocalModelNode,
    ) -> Result<LocalModelNode, ReconcileError>;

    /// Replace `spec.localModels`, failing if the resource changed since
    /// `resource_version` was read
    async fn patch_local_models(
        &self,
        name: &str,
        resource_version: Option<String>,
        models: &[LocalModelInfo],
    ) -> Result<LocalModelNode, ReconcileError>;

    /// Get a PersistentVolume
    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>, ReconcileError>;

    /// Create a PersistentVolume
    async fn create_pv(&self, pv: &PersistentVolume) -> Result<(), ReconcileError>;

    /// Delete a PersistentVolume (absent is fine)
    async fn delete_pv(&self, name: &str) -> Result<(), ReconcileError>;

    /// Get a PersistentVolumeClaim
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, ReconcileError>;

    /// Create a PersistentVolumeClaim
    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), ReconcileError>;

    /// Delete a PersistentVolumeClaim (absent is fine)
    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), ReconcileError>;

    /// List inference workloads matching a label selector, optionally within
    /// one namespace
    async fn list_consumers<'a>(
        &self,
        namespace: Option<&'a str>,
        selector: &str,
    ) -> Result<Vec<ConsumerWorkload>, ReconcileError>;
}

/// Merge patch turning `previous` into `current`
///
/// Nodes missing from `current.nodeStatus` are nulled so the API server
/// drops them.
pub fn cache_status_patch(
    previous: &LocalModelCacheStatus,
    current: &LocalModelCacheStatus,
) -> Value {
    let mut status = json!(current);
    if let Some(nodes) = status.get_mut("nodeStatus").and_then(Value::as_object_mut) {
        for node in previous
            .node_status
            .keys()
            .filter(|n| !current.node_status.contains_key(*n))
        {
            nodes.insert(node.clone(), Value::Null);
        }
    }
    json!({ "status": status })
}

/// Real Kubernetes client implementation
pub struct CacheKubeImpl {
    client: Client,
}

impl CacheKubeImpl {
    /// Create a new CacheKubeImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_cache_metadata(
        &self,
        scope: &CacheScope,
        patch: serde_json::Value,
    ) -> Result<(), kube::Error> {
        let params = PatchParams::apply(FIELD_MANAGER);
        match (scope.kind, scope.namespace.as_deref()) {
            (CacheKind::Namespaced, Some(ns)) => {
                let api: Api<LocalModelNamespaceCache> =
                    Api::namespaced(self.client.clone(), ns);
                api.patch(&scope.name, &params, &Patch::Merge(&patch)).await?;
            }
            _ => {
                let api: Api<LocalModelCache> = Api::all(self.client.clone());
                api.patch(&scope.name, &params, &Patch::Merge(&patch)).await?;
            }
        }
        Ok(())
    }

    fn finalizer_patch(scope: &CacheScope, finalizers: Vec<String>) -> serde_json::Value {
        json!({
            "metadata": {
                "resourceVersion": scope.resource_version,
                "finalizers": finalizers,
            }
        })
    }
}

#[async_trait]
impl CacheKube for CacheKubeImpl {
    async fn add_finalizer(&self, scope: &CacheScope) -> Result<(), ReconcileError> {
        if scope.has_finalizer() {
            return Ok(());
        }
        let mut finalizers = scope.finalizers.clone();
        finalizers.push(scope.finalizer().to_string());
        self.patch_cache_metadata(scope, Self::finalizer_patch(scope, finalizers))
            .await
            .map_err(|e| ReconcileError::kube("failed to add finalizer", e))
    }

    async fn remove_finalizer(&self, scope: &CacheScope) -> Result<(), ReconcileError> {
        let finalizers: Vec<String> = scope
            .finalizers
            .iter()
            .filter(|f| *f != scope.finalizer())
            .cloned()
            .collect();
        match self
            .patch_cache_metadata(scope, Self::finalizer_patch(scope, finalizers))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(ReconcileError::kube("failed to remove finalizer", e)),
        }
    }

    async fn patch_cache_status(
        &self,
        scope: &CacheScope,
        previous: &LocalModelCacheStatus,
        status: &LocalModelCacheStatus,
    ) -> Result<(), ReconcileError> {
        let patch = cache_status_patch(previous, status);
        let params = PatchParams::apply(FIELD_MANAGER);
        let result = match (scope.kind, scope.namespace.as_deref()) {
            (CacheKind::Namespaced, Some(ns)) => {
                let api: Api<LocalModelNamespaceCache> =
                    Api::namespaced(self.client.clone(), ns);
                api.patch_status(&scope.name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
            _ => {
                let api: Api<LocalModelCache> = Api::all(self.client.clone());
                api.patch_status(&scope.name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
            }
        };
        result.map_err(|e| ReconcileError::kube("failed to update cache status", e))
    }

    async fn get_node_group(
        &self,
        name: &str,
    ) -> Result<Option<LocalModelNodeGroup>, ReconcileError> {
        let api: Api<LocalModelNodeGroup> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| ReconcileError::kube(format!("failed to get node group {}", name), e))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, ReconcileError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api
            .list(&ListParams::default())
            .await
            .map_err(|e| ReconcileError::kube("failed to list nodes", e))?;
        Ok(nodes.items)
    }

    async fn get_local_model_node(
        &self,
        name: &str,
    ) -> Result<Option<LocalModelNode>, ReconcileError> {
        let api: Api<LocalModelNode> = Api::all(self.client.clone());
        api.get_opt(name).await.map_err(|e| {
            ReconcileError::kube(format!("failed to get LocalModelNode {}", name), e)
        })
    }

    async fn create_local_model_node(
        &self,
        node: &LocalModelNode,
    ) -> Result<LocalModelNode, ReconcileError> {
        let api: Api<LocalModelNode> = Api::all(self.client.clone());
        api.create(&PostParams::default(), node)
            .await
            .map_err(|e| ReconcileError::kube("failed to create LocalModelNode", e))
    }

    async fn patch_local_models(
        &self,
        name: &str,
        resource_version: Option<String>,
        models: &[LocalModelInfo],
    ) -> Result<LocalModelNode, ReconcileError> {
        let api: Api<LocalModelNode> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": { "resourceVersion": resource_version },
            "spec": { "localModels": models },
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| {
                ReconcileError::kube(format!("failed to update LocalModelNode {}", name), e)
            })
    }

    async fn get_pv(&self, name: &str) -> Result<Option<PersistentVolume>, ReconcileError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| ReconcileError::kube(format!("failed to get PV {}", name), e))
    }

    async fn create_pv(&self, pv: &PersistentVolume) -> Result<(), ReconcileError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.create(&PostParams::default(), pv).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(pv = %pv.name_any(), "PV already exists");
                Ok(())
            }
            Err(e) => Err(ReconcileError::kube(
                format!("failed to create PV {}", pv.name_any()),
                e,
            )),
        }
    }

    async fn delete_pv(&self, name: &str) -> Result<(), ReconcileError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(pv = %name, "PV not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(ReconcileError::kube(format!("failed to delete PV {}", name), e)),
        }
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, ReconcileError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(|e| {
            ReconcileError::kube(format!("failed to get PVC {}/{}", namespace, name), e)
        })
    }

    async fn create_pvc(
        &self,
        namespace: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<(), ReconcileError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), pvc).await {
            Ok(_) => Ok(()),
            Err(e) if is_conflict(&e) => {
                debug!(pvc = %pvc.name_any(), namespace = %namespace, "PVC already exists");
                Ok(())
            }
            Err(e) => Err(ReconcileError::kube(
                format!("failed to create PVC {}/{}", namespace, pvc.name_any()),
                e,
            )),
        }
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(pvc = %name, namespace = %namespace, "PVC not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(ReconcileError::kube(
                format!("failed to delete PVC {}/{}", namespace, name),
                e,
            )),
        }
    }

    async fn list_consumers<'a>(
        &self,
        namespace: Option<&'a str>,
        selector: &str,
    ) -> Result<Vec<ConsumerWorkload>, ReconcileError> {
        let ar = inference_service_resource();
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        };
        match api.list(&ListParams::default().labels(selector)).await {
            Ok(list) => Ok(list.items.iter().map(ConsumerWorkload::from_dynamic).collect()),
            // Inference workload CRD not installed: nothing consumes the cache
            Err(e) if is_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(ReconcileError::kube("failed to list inference workloads", e)),
        }
    }
}

//! Cache scope value object
//!
//! Both cache kinds are reconciled by the same engine. The adapters turn the
//! watched object into a [`CacheScope`], which carries the identity, spec,
//! finalizer and ownership capability the engine needs.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

use lattice_common::crd::{
    download_pvc_name, model_status_key, LocalModelCache, LocalModelCacheStatus, LocalModelInfo,
    LocalModelNamespaceCache, LocalModelStorageSpec,
};
use lattice_common::kube_utils::controller_owner_ref;
use lattice_common::{LOCAL_MODEL_LABEL, LOCAL_MODEL_NAMESPACE_LABEL};

/// Finalizer placed on cluster-scoped caches
pub const CLUSTER_CACHE_FINALIZER: &str = "localmodelcache.lattice.dev/finalizer";

/// Finalizer placed on namespace-scoped caches
pub const NAMESPACE_CACHE_FINALIZER: &str = "localmodelnamespacecache.lattice.dev/finalizer";

/// Which of the two cache kinds a scope was built from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheKind {
    /// `LocalModelCache`
    Cluster,
    /// `LocalModelNamespaceCache`
    Namespaced,
}

impl CacheKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Cluster => "LocalModelCache",
            CacheKind::Namespaced => "LocalModelNamespaceCache",
        }
    }
}

/// A volume object the cache may want to own
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeTarget<'a> {
    /// A (cluster-scoped) PersistentVolume
    Volume,
    /// A PersistentVolumeClaim in the given namespace
    Claim(&'a str),
}

/// Everything the reconciliation engine needs to know about one cache
#[derive(Clone, Debug, PartialEq)]
pub struct CacheScope {
    /// Which kind this scope came from
    pub kind: CacheKind,
    /// Cache name (also the model name)
    pub name: String,
    /// Cache namespace; `None` for cluster-scoped caches
    pub namespace: Option<String>,
    /// Object resourceVersion, used for optimistic finalizer patches
    pub resource_version: Option<String>,
    /// Controller owner reference to the cache object
    pub owner: Option<OwnerReference>,
    /// Where the model is downloaded from
    pub source_model_uri: String,
    /// Node groups; the first is the default
    pub node_groups: Vec<String>,
    /// Service account for download jobs
    pub service_account_name: Option<String>,
    /// Storage credentials/overrides
    pub storage: Option<LocalModelStorageSpec>,
    /// Current finalizers
    pub finalizers: Vec<String>,
    /// Deletion timestamp is set
    pub deleting: bool,
    /// Last persisted status
    pub status: LocalModelCacheStatus,
}

impl CacheScope {
    /// Build a scope from a cluster-scoped cache
    pub fn from_cluster(cache: &LocalModelCache) -> Self {
        Self {
            kind: CacheKind::Cluster,
            name: cache.name_any(),
            namespace: None,
            resource_version: cache.resource_version(),
            owner: controller_owner_ref(cache),
            source_model_uri: cache.spec.source_model_uri.clone(),
            node_groups: cache.spec.node_groups.clone(),
            service_account_name: cache.spec.service_account_name.clone(),
            storage: cache.spec.storage.clone(),
            finalizers: cache.finalizers().to_vec(),
            deleting: cache.metadata.deletion_timestamp.is_some(),
            status: cache.status.clone().unwrap_or_default(),
        }
    }

    /// Build a scope from a namespace-scoped cache
    pub fn from_namespaced(cache: &LocalModelNamespaceCache) -> Self {
        Self {
            kind: CacheKind::Namespaced,
            name: cache.name_any(),
            namespace: Some(cache.namespace().unwrap_or_default()),
            resource_version: cache.resource_version(),
            owner: controller_owner_ref(cache),
            source_model_uri: cache.spec.source_model_uri.clone(),
            node_groups: cache.spec.node_groups.clone(),
            service_account_name: cache.spec.service_account_name.clone(),
            storage: cache.spec.storage.clone(),
            finalizers: cache.finalizers().to_vec(),
            deleting: cache.metadata.deletion_timestamp.is_some(),
            status: cache.status.clone().unwrap_or_default(),
        }
    }

    /// Namespace as it appears in per-node model entries (empty when cluster-scoped)
    pub fn model_namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    /// `name` or `namespace/name`, for logs and metrics
    pub fn display_name(&self) -> String {
        model_status_key(self.model_namespace(), &self.name)
    }

    /// Finalizer this cache kind uses
    pub fn finalizer(&self) -> &'static str {
        match self.kind {
            CacheKind::Cluster => CLUSTER_CACHE_FINALIZER,
            CacheKind::Namespaced => NAMESPACE_CACHE_FINALIZER,
        }
    }

    /// Whether the finalizer is already present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers.iter().any(|f| f == self.finalizer())
    }

    /// Node group used by consumers that do not request one
    pub fn default_node_group(&self) -> Option<&str> {
        self.node_groups.first().map(String::as_str)
    }

    /// Key of this model in per-node status maps
    pub fn status_key(&self) -> String {
        model_status_key(self.model_namespace(), &self.name)
    }

    /// Descriptor written into each per-node resource
    pub fn model_info(&self) -> LocalModelInfo {
        LocalModelInfo {
            model_name: self.name.clone(),
            namespace: self.model_namespace().to_string(),
            source_model_uri: self.source_model_uri.clone(),
            service_account_name: self.service_account_name.clone(),
            storage: self.storage.clone(),
        }
    }

    // =========================================================================
    // Ownership
    // =========================================================================

    /// Whether an owner reference to this cache may be set on `target`
    ///
    /// A cluster-scoped cache may own anything. A namespace-scoped cache can
    /// own neither PersistentVolumes (cluster-scoped) nor claims outside its
    /// own namespace; those must be deleted explicitly on teardown.
    pub fn can_own(&self, target: VolumeTarget<'_>) -> bool {
        match (self.kind, target) {
            (CacheKind::Cluster, _) => true,
            (CacheKind::Namespaced, VolumeTarget::Volume) => false,
            (CacheKind::Namespaced, VolumeTarget::Claim(ns)) => {
                self.namespace.as_deref() == Some(ns)
            }
        }
    }

    /// Owner references to set on `target`, empty when ownership is not permitted
    pub fn owner_references_for(&self, target: VolumeTarget<'_>) -> Vec<OwnerReference> {
        if !self.can_own(target) {
            return Vec::new();
        }
        self.owner.iter().cloned().collect()
    }

    // =========================================================================
    // Volume naming
    // =========================================================================

    /// Download PV name for a node group
    pub fn download_pv_name(&self, group: &str) -> String {
        match &self.namespace {
            None => format!("{}-{}-download", self.name, group),
            Some(ns) => format!("{}-{}-{}-download", self.name, group, ns),
        }
    }

    /// Download PVC name for a node group
    pub fn download_pvc_name(&self, group: &str) -> String {
        download_pvc_name(self.model_namespace(), &self.name, group)
    }

    /// Namespace of the download PVC (and of download jobs)
    pub fn download_namespace<'a>(&'a self, job_namespace: &'a str) -> &'a str {
        self.namespace.as_deref().unwrap_or(job_namespace)
    }

    /// Serving PV name for a node group and consuming namespace
    pub fn serving_pv_name(&self, group: &str, consumer_namespace: &str) -> String {
        format!("{}-{}-{}", self.name, group, consumer_namespace)
    }

    /// Serving PVC name for a node group (created in the consuming namespace)
    pub fn serving_pvc_name(&self, group: &str) -> String {
        format!("{}-{}", self.name, group)
    }

    /// Whether deleting the serving PVC in `consumer_namespace` would remove
    /// the download PVC instead (cluster caches share the name in the job
    /// namespace)
    pub fn serving_claim_is_download_claim(
        &self,
        consumer_namespace: &str,
        job_namespace: &str,
    ) -> bool {
        self.kind == CacheKind::Cluster && consumer_namespace == job_namespace
    }

    // =========================================================================
    // Consumers
    // =========================================================================

    /// Label selector matching workloads that consume this cache
    pub fn workload_selector(&self) -> String {
        match &self.namespace {
            None => format!("{}={},!{}", LOCAL_MODEL_LABEL, self.name, LOCAL_MODEL_NAMESPACE_LABEL),
            Some(ns) => format!(
                "{}={},{}={}",
                LOCAL_MODEL_LABEL, self.name, LOCAL_MODEL_NAMESPACE_LABEL, ns
            ),
        }
    }

    /// Namespace to list consumers in; `None` lists cluster-wide
    pub fn workload_namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }
}

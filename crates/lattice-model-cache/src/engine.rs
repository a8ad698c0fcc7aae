//! Cache reconciliation engine
//!
//! One state machine drives both cache kinds:
//! - Deleting → remove the model from every node, delete unowned volumes,
//!   drop the finalizer
//! - Otherwise → ensure finalizer, resolve node groups, fan the model out to
//!   every matching node, provision download and serving volumes
//!
//! Steps after node-group resolution are best effort: a failure on one node
//! or volume is logged and the remaining items are still processed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use lattice_common::affinity::node_matches_volume;
use lattice_common::crd::{
    LocalModelCacheStatus, LocalModelInfo, LocalModelNode, LocalModelNodeGroup,
    LocalModelNodeSpec, ModelCopies, NamespacedName, NodeStatus,
};
use lattice_common::kube_utils::is_node_ready;
use lattice_common::metrics::set_model_copies;
use lattice_common::{LocalModelConfig, ReconcileError};

use crate::client::{CacheKube, CacheKubeImpl};
use crate::scope::{CacheKind, CacheScope};
use crate::volumes;

/// Periodic resync for caches, catching node and workload drift that no
/// watch surfaced
pub const CACHE_RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Shared context for both cache controllers
pub struct CacheContext {
    /// Kubernetes access
    pub kube: Arc<dyn CacheKube>,
    /// Cluster-wide local model settings
    pub config: LocalModelConfig,
}

impl CacheContext {
    /// Create a context backed by a real client
    pub fn new(client: Client, config: LocalModelConfig) -> Self {
        Self {
            kube: Arc::new(CacheKubeImpl::new(client)),
            config,
        }
    }

    /// Create a context with a custom Kubernetes implementation
    pub fn with_kube(kube: Arc<dyn CacheKube>, config: LocalModelConfig) -> Self {
        Self { kube, config }
    }
}

/// Reconcile one cache described by `scope`
pub async fn reconcile_cache(
    scope: &CacheScope,
    ctx: &CacheContext,
) -> Result<Action, ReconcileError> {
    let kube = ctx.kube.as_ref();
    let cache = scope.display_name();

    if scope.deleting {
        return handle_deletion(scope, ctx).await;
    }

    info!(cache = %cache, kind = scope.kind.as_str(), "Reconciling local model cache");

    if !scope.has_finalizer() {
        kube.add_finalizer(scope).await?;
    }

    let groups = resolve_node_groups(kube, scope).await?;
    let nodes = kube.list_nodes().await?;

    let mut status = scope.status.clone();
    let mut persisted = scope.status.clone();

    let members: Vec<(&LocalModelNodeGroup, Vec<&Node>)> = groups
        .iter()
        .map(|group| (group, matching_nodes(group, &nodes)))
        .collect();

    // Nodes that left every group no longer count as copies
    let member_names: BTreeSet<String> = members
        .iter()
        .flat_map(|(_, nodes)| nodes.iter().map(|n| n.name_any()))
        .collect();
    status
        .node_status
        .retain(|node, _| member_names.contains(node));

    for (group, group_nodes) in &members {
        for node in group_nodes {
            let node_name = node.name_any();
            if !is_node_ready(node) {
                status
                    .node_status
                    .entry(node_name)
                    .or_insert(NodeStatus::NotReady);
                continue;
            }
            match ensure_node_membership(kube, scope, &node_name).await {
                Ok(node_status) => {
                    status.node_status.insert(node_name, node_status);
                }
                Err(e) => {
                    warn!(cache = %cache, node = %node_name, error = %e, "Failed to update LocalModelNode");
                }
            }
        }

        let copies = aggregate_copies(&status.node_status);
        set_model_copies(&cache, copies.total, copies.available, copies.failed);
        status.copies = Some(copies);
        debug!(cache = %cache, group = %group.name_any(), "Node group fan-out complete");
        persist_status(kube, scope, &status, &mut persisted).await;
    }

    if ctx.config.disable_volume_management {
        debug!(cache = %cache, "Volume management disabled, skipping volumes");
    } else {
        volumes::ensure_download_volumes(kube, scope, &groups, &ctx.config.job_namespace).await;
        reconcile_serving_volumes(kube, scope, &groups, &ctx.config.job_namespace, &mut status)
            .await;
        persist_status(kube, scope, &status, &mut persisted).await;
    }

    Ok(Action::requeue(CACHE_RESYNC_INTERVAL))
}

// =============================================================================
// Deletion
// =============================================================================

/// Remove the model from every node and release the finalizer
async fn handle_deletion(
    scope: &CacheScope,
    ctx: &CacheContext,
) -> Result<Action, ReconcileError> {
    let kube = ctx.kube.as_ref();
    let cache = scope.display_name();

    if !scope.has_finalizer() {
        return Ok(Action::await_change());
    }

    info!(cache = %cache, "Cleaning up deleted local model cache");

    let mut groups = Vec::new();
    for name in &scope.node_groups {
        match kube.get_node_group(name).await? {
            Some(group) => groups.push(group),
            None => debug!(cache = %cache, group = %name, "Node group already gone"),
        }
    }

    let nodes = kube.list_nodes().await?;
    let mut first_error = None;
    for group in &groups {
        for node in matching_nodes(group, &nodes) {
            let node_name = node.name_any();
            if let Err(e) = remove_node_membership(kube, scope, &node_name).await {
                warn!(cache = %cache, node = %node_name, error = %e, "Failed to remove model from node");
                first_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    // Namespace-scoped caches cannot own their PVs, so nothing else will
    // garbage collect them
    if scope.kind == CacheKind::Namespaced {
        let namespace = scope.model_namespace();
        let job_namespace = ctx.config.job_namespace.as_str();
        for group in &scope.node_groups {
            let pv = scope.download_pv_name(group);
            if let Err(e) = kube.delete_pv(&pv).await {
                warn!(cache = %cache, pv = %pv, error = %e, "Failed to delete download PV");
            }
            let pvc = scope.download_pvc_name(group);
            if let Err(e) = kube.delete_pvc(namespace, &pvc).await {
                warn!(cache = %cache, pvc = %pvc, error = %e, "Failed to delete download PVC");
            }
            volumes::delete_serving_volumes(kube, scope, group, namespace, job_namespace).await;
        }
    }

    kube.remove_finalizer(scope).await?;
    info!(cache = %cache, "Local model cache cleanup complete");
    Ok(Action::await_change())
}

async fn remove_node_membership(
    kube: &dyn CacheKube,
    scope: &CacheScope,
    node_name: &str,
) -> Result<(), ReconcileError> {
    let Some(lmn) = kube.get_local_model_node(node_name).await? else {
        return Ok(());
    };
    let info = scope.model_info();
    let mut models = lmn.spec.local_models.clone();
    let before = models.len();
    models.retain(|m| !m.same_model(&info));
    if models.len() == before {
        return Ok(());
    }
    info!(node = %node_name, model = %scope.display_name(), "Removing model from LocalModelNode");
    kube.patch_local_models(node_name, lmn.resource_version(), &models)
        .await?;
    Ok(())
}

// =============================================================================
// Fan-out
// =============================================================================

async fn resolve_node_groups(
    kube: &dyn CacheKube,
    scope: &CacheScope,
) -> Result<Vec<LocalModelNodeGroup>, ReconcileError> {
    let mut groups = Vec::with_capacity(scope.node_groups.len());
    for name in &scope.node_groups {
        let group = kube.get_node_group(name).await?.ok_or_else(|| {
            ReconcileError::Config(format!(
                "node group {} referenced by {} not found",
                name,
                scope.display_name()
            ))
        })?;
        groups.push(group);
    }
    Ok(groups)
}

/// Nodes selected by the group's PV node affinity
///
/// A malformed affinity is logged and matches nothing.
fn matching_nodes<'a>(group: &LocalModelNodeGroup, nodes: &'a [Node]) -> Vec<&'a Node> {
    nodes
        .iter()
        .filter(|node| {
            match node_matches_volume(&group.spec.persistent_volume_spec, node) {
                Ok(matched) => matched,
                Err(e) => {
                    warn!(group = %group.name_any(), node = %node.name_any(), error = %e, "Invalid node group affinity");
                    false
                }
            }
        })
        .collect()
}

/// Insert or refresh `info` in a node's model list
///
/// Returns true when the list changed. Duplicate entries for the same model
/// are collapsed into one.
pub fn upsert_model(models: &mut Vec<LocalModelInfo>, info: &LocalModelInfo) -> bool {
    let mut changed = false;
    let mut seen = false;
    models.retain_mut(|m| {
        if !m.same_model(info) {
            return true;
        }
        if seen {
            changed = true;
            return false;
        }
        seen = true;
        if m != info {
            *m = info.clone();
            changed = true;
        }
        true
    });
    if !seen {
        models.push(info.clone());
        changed = true;
    }
    changed
}

/// Ensure the node's LocalModelNode lists the model and return the node's
/// reported state for it
async fn ensure_node_membership(
    kube: &dyn CacheKube,
    scope: &CacheScope,
    node_name: &str,
) -> Result<NodeStatus, ReconcileError> {
    let info = scope.model_info();
    let key = scope.status_key();

    let lmn = match kube.get_local_model_node(node_name).await? {
        Some(lmn) => lmn,
        None => {
            info!(node = %node_name, model = %key, "Creating LocalModelNode");
            let lmn = LocalModelNode::new(
                node_name,
                LocalModelNodeSpec {
                    local_models: vec![info],
                },
            );
            let created = kube.create_local_model_node(&lmn).await?;
            return Ok(reported_status(&created, &key));
        }
    };

    let mut models = lmn.spec.local_models.clone();
    if upsert_model(&mut models, &info) {
        info!(node = %node_name, model = %key, "Updating LocalModelNode models");
        kube.patch_local_models(node_name, lmn.resource_version(), &models)
            .await?;
    }
    Ok(reported_status(&lmn, &key))
}

fn reported_status(lmn: &LocalModelNode, key: &str) -> NodeStatus {
    lmn.model_status(key)
        .map(NodeStatus::from)
        .unwrap_or(NodeStatus::DownloadPending)
}

/// Recompute copy counts from the full per-node map
pub fn aggregate_copies(node_status: &BTreeMap<String, NodeStatus>) -> ModelCopies {
    let count = |wanted: NodeStatus| {
        node_status.values().filter(|s| **s == wanted).count() as i32
    };
    ModelCopies {
        total: node_status.len() as i32,
        available: count(NodeStatus::Downloaded),
        failed: count(NodeStatus::DownloadError),
    }
}

async fn persist_status(
    kube: &dyn CacheKube,
    scope: &CacheScope,
    status: &LocalModelCacheStatus,
    persisted: &mut LocalModelCacheStatus,
) {
    if status == persisted {
        return;
    }
    match kube.patch_cache_status(scope, persisted, status).await {
        Ok(()) => *persisted = status.clone(),
        Err(e) => {
            warn!(cache = %scope.display_name(), error = %e, "Failed to update cache status")
        }
    }
}

// =============================================================================
// Serving volumes
// =============================================================================

/// Provision serving volumes for every consuming namespace and retire those
/// of namespaces that stopped consuming the cache
async fn reconcile_serving_volumes(
    kube: &dyn CacheKube,
    scope: &CacheScope,
    groups: &[LocalModelNodeGroup],
    job_namespace: &str,
    status: &mut LocalModelCacheStatus,
) {
    let cache = scope.display_name();
    let consumers = match kube
        .list_consumers(scope.workload_namespace(), &scope.workload_selector())
        .await
    {
        Ok(consumers) => consumers,
        Err(e) => {
            warn!(cache = %cache, error = %e, "Failed to list inference workloads");
            return;
        }
    };

    let Some(default_group) = groups.first() else {
        return;
    };
    let by_name: BTreeMap<String, &LocalModelNodeGroup> =
        groups.iter().map(|g| (g.name_any(), g)).collect();

    let mut services = BTreeSet::new();
    let mut wanted: BTreeMap<String, BTreeMap<String, &LocalModelNodeGroup>> = BTreeMap::new();
    for consumer in consumers {
        let group = match consumer.node_group.as_deref() {
            None => default_group,
            Some(name) => match by_name.get(name) {
                Some(group) => *group,
                None => {
                    warn!(
                        cache = %cache,
                        workload = %consumer.name,
                        namespace = %consumer.namespace,
                        group = %name,
                        "Workload requests a node group the cache does not use, skipping"
                    );
                    continue;
                }
            },
        };
        wanted
            .entry(consumer.namespace.clone())
            .or_default()
            .insert(group.name_any(), group);
        services.insert(NamespacedName {
            name: consumer.name,
            namespace: consumer.namespace,
        });
    }

    let previous: BTreeSet<&str> = status
        .inference_services
        .iter()
        .map(|s| s.namespace.as_str())
        .collect();
    for namespace in previous {
        if wanted.contains_key(namespace) {
            continue;
        }
        info!(cache = %cache, namespace = %namespace, "Namespace no longer consumes cache, removing serving volumes");
        for group in &scope.node_groups {
            volumes::delete_serving_volumes(kube, scope, group, namespace, job_namespace).await;
        }
    }

    for (namespace, namespace_groups) in &wanted {
        for group in namespace_groups.values() {
            volumes::ensure_serving_volumes(kube, scope, group, namespace).await;
        }
    }

    status.inference_services = services.into_iter().collect();
}

//! Controller runner - builds controller futures for each mode
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim};
use kube::api::DynamicObject;
use kube::runtime::reflector::{self, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};

use lattice_common::crd::{
    LocalModelCache, LocalModelNamespaceCache, LocalModelNode, LocalModelNodeGroup,
};
use lattice_common::kube_utils::inference_service_resource;
use lattice_common::LocalModelConfig;
use lattice_model_agent::{self as agent_ctrl, AgentContext, ModelFilesystem};
use lattice_model_cache::node_group::{self as node_group_ctrl, NodeGroupContext};
use lattice_model_cache::watches::{
    caches_using_groups, cluster_caches_for_local_model_node, cluster_caches_for_workload,
    groups_for_node, namespace_caches_for_local_model_node, namespace_caches_for_workload,
    node_readiness_filter, node_status_filter, workload_filter,
};
use lattice_model_cache::{
    error_policy, reconcile_cluster_cache, reconcile_namespace_cache, CacheContext,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller (or reflector) driven to completion by the caller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Keep a store of node groups current for the node mappers
fn node_group_reflector(client: Client) -> (Store<LocalModelNodeGroup>, ControllerFuture) {
    let groups: Api<LocalModelNodeGroup> = Api::all(client);
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher::watcher(groups, watcher_config()))
        .default_backoff()
        .touched_objects()
        .for_each(|res| {
            match res {
                Ok(group) => tracing::debug!(
                    group = group.metadata.name.as_deref().unwrap_or("unknown"),
                    "Node group reflector updated"
                ),
                Err(e) => tracing::warn!("Node group reflector error: {}", e),
            }
            futures::future::ready(())
        });
    (reader, Box::pin(stream))
}

/// Build the LocalModelCache and LocalModelNamespaceCache controllers
///
/// Both watch nodes (new or newly ready), LocalModelNodes (reported status
/// changes) and, unless volume management is disabled, inference workloads.
pub fn build_cache_controllers(client: Client, config: LocalModelConfig) -> Vec<ControllerFuture> {
    let watch_workloads = !config.disable_volume_management;
    let ctx = Arc::new(CacheContext::new(client.clone(), config));
    let (groups, groups_reflector) = node_group_reflector(client.clone());
    let workloads = inference_service_resource();

    // Cluster-scoped caches
    let cluster_ctrl = Controller::new(
        Api::<LocalModelCache>::all(client.clone()),
        watcher_config(),
    );
    let cluster_store = cluster_ctrl.store();
    let node_filter = Arc::new(node_readiness_filter());
    let node_groups = groups.clone();
    let status_filter = Arc::new(node_status_filter());
    let mut cluster_ctrl = cluster_ctrl
        .owns(Api::<PersistentVolume>::all(client.clone()), watcher_config())
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher_config(),
        )
        .watches(Api::<Node>::all(client.clone()), watcher_config(), move |node| {
            if !node_filter.admits(&node) {
                return Vec::new();
            }
            caches_using_groups(&cluster_store, &groups_for_node(&node, &node_groups))
        })
        .watches(
            Api::<LocalModelNode>::all(client.clone()),
            watcher_config(),
            move |lmn| {
                if !status_filter.admits(&lmn) {
                    return Vec::new();
                }
                cluster_caches_for_local_model_node(&lmn)
            },
        );
    if watch_workloads {
        let filter = Arc::new(workload_filter());
        cluster_ctrl = cluster_ctrl.watches_with(
            Api::<DynamicObject>::all_with(client.clone(), &workloads),
            workloads.clone(),
            watcher_config(),
            move |workload| {
                filter
                    .observe(&workload)
                    .map(cluster_caches_for_workload)
                    .unwrap_or_default()
            },
        );
    }
    let cluster_ctrl = cluster_ctrl
        .shutdown_on_signal()
        .run(
            reconcile_cluster_cache,
            error_policy::<LocalModelCache>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("LocalModelCache"));

    // Namespace-scoped caches
    let namespace_ctrl = Controller::new(
        Api::<LocalModelNamespaceCache>::all(client.clone()),
        watcher_config(),
    );
    let namespace_store = namespace_ctrl.store();
    let node_filter = Arc::new(node_readiness_filter());
    let node_groups = groups;
    let status_filter = Arc::new(node_status_filter());
    let mut namespace_ctrl = namespace_ctrl
        .watches(Api::<Node>::all(client.clone()), watcher_config(), move |node| {
            if !node_filter.admits(&node) {
                return Vec::new();
            }
            caches_using_groups(&namespace_store, &groups_for_node(&node, &node_groups))
        })
        .watches(
            Api::<LocalModelNode>::all(client.clone()),
            watcher_config(),
            move |lmn| {
                if !status_filter.admits(&lmn) {
                    return Vec::new();
                }
                namespace_caches_for_local_model_node(&lmn)
            },
        );
    if watch_workloads {
        let filter = Arc::new(workload_filter());
        namespace_ctrl = namespace_ctrl.watches_with(
            Api::<DynamicObject>::all_with(client, &workloads),
            workloads.clone(),
            watcher_config(),
            move |workload| {
                filter
                    .observe(&workload)
                    .map(namespace_caches_for_workload)
                    .unwrap_or_default()
            },
        );
    }
    let namespace_ctrl = namespace_ctrl
        .shutdown_on_signal()
        .run(
            reconcile_namespace_cache,
            error_policy::<LocalModelNamespaceCache>,
            ctx,
        )
        .for_each(log_reconcile_result("LocalModelNamespaceCache"));

    tracing::info!("- LocalModelCache controller");
    tracing::info!("- LocalModelNamespaceCache controller");
    if !watch_workloads {
        tracing::info!("Volume management disabled, inference workloads are not watched");
    }

    vec![
        groups_reflector,
        Box::pin(cluster_ctrl),
        Box::pin(namespace_ctrl),
    ]
}

/// Build the LocalModelNodeGroup controller that deploys node agents
pub fn build_node_group_controller(
    client: Client,
    config: LocalModelConfig,
    namespace: String,
) -> Vec<ControllerFuture> {
    let groups: Api<LocalModelNodeGroup> = Api::all(client.clone());
    let daemonsets: Api<DaemonSet> = Api::namespaced(client.clone(), &namespace);
    let ctx = Arc::new(NodeGroupContext::new(client, config, namespace));

    tracing::info!("- LocalModelNodeGroup controller");

    vec![Box::pin(
        Controller::new(groups, watcher_config())
            .owns(daemonsets, watcher_config())
            .shutdown_on_signal()
            .run(node_group_ctrl::reconcile, node_group_ctrl::error_policy, ctx)
            .for_each(log_reconcile_result("LocalModelNodeGroup")),
    )]
}

/// Build the node agent controller for `node_name`
///
/// Only this node's LocalModelNode is watched, plus the download jobs the
/// agent created on the node.
pub fn build_agent_controller(
    client: Client,
    node_name: String,
    fs: Arc<dyn ModelFilesystem>,
    config: LocalModelConfig,
) -> Vec<ControllerFuture> {
    let nodes: Api<LocalModelNode> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());
    let node_fields = format!("metadata.name={}", node_name);
    let job_labels = agent_ctrl::node_job_selector(&node_name);
    let ctx = Arc::new(AgentContext::new(client, fs, node_name.clone(), config));

    tracing::info!(node = %node_name, "- LocalModelNode agent controller");

    vec![Box::pin(
        Controller::new(nodes, watcher_config().fields(&node_fields))
            .owns(jobs, watcher_config().labels(&job_labels))
            .shutdown_on_signal()
            .run(agent_ctrl::reconcile, agent_ctrl::error_policy, ctx)
            .for_each(log_reconcile_result("LocalModelNode")),
    )]
}

/// Create a closure that logs reconciliation results
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

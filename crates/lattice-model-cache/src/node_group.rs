//! LocalModelNodeGroup controller
//!
//! Deploys the node agent onto every node of a group:
//! - PV `{group}-agent` copied from the group's PV template
//! - PVC `{group}-agent` in the operator namespace, bound to that PV
//! - DaemonSet `{group}-agent` pinned to the group's nodes by the PV's
//!   node affinity, mounting the claim at `/mnt/models`
//!
//! All three are owned by the group, so deletion only has to release the
//! finalizer.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, EnvVar, EnvVarSource, NodeAffinity, NodeSelector,
    ObjectFieldSelector, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use lattice_common::crd::LocalModelNodeGroup;
use lattice_common::error::is_conflict;
use lattice_common::kube_utils::controller_owner_ref;
use lattice_common::metrics::ReconcileTimer;
use lattice_common::{LocalModelConfig, ReconcileError, MODEL_MOUNT_PATH};

use crate::controller::ERROR_REQUEUE;

/// Finalizer placed on node groups
pub const NODE_GROUP_FINALIZER: &str = "localmodelnodegroup.lattice.dev/finalizer";

/// Service account the node agent runs as
pub const AGENT_SERVICE_ACCOUNT: &str = "lattice-local-model-agent";

/// Field manager for the agent DaemonSet
const FIELD_MANAGER: &str = "lattice-model-cache-node-group";

const AGENT_SUFFIX: &str = "-agent";
const AGENT_CONTAINER: &str = "manager";
const MODELS_VOLUME: &str = "models";

/// Name shared by the agent PV, PVC and DaemonSet of a group
pub fn agent_name(group: &str) -> String {
    format!("{}{}", group, AGENT_SUFFIX)
}

/// Trait abstracting Kubernetes operations for the node-group controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeGroupKube: Send + Sync {
    /// Replace the group's finalizer list
    async fn set_finalizers(
        &self,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError>;

    /// Create the PV unless it exists
    async fn ensure_pv(&self, pv: &PersistentVolume) -> Result<(), ReconcileError>;

    /// Create the PVC unless it exists
    async fn ensure_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ReconcileError>;

    /// Server-side apply the agent DaemonSet
    async fn apply_daemonset(&self, daemonset: &DaemonSet) -> Result<(), ReconcileError>;
}

/// Real Kubernetes client implementation
pub struct NodeGroupKubeImpl {
    client: Client,
}

impl NodeGroupKubeImpl {
    /// Create a new NodeGroupKubeImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeGroupKube for NodeGroupKubeImpl {
    async fn set_finalizers(
        &self,
        name: &str,
        resource_version: Option<String>,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError> {
        let api: Api<LocalModelNodeGroup> = Api::all(self.client.clone());
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers,
            }
        });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| ReconcileError::kube("failed to update node group finalizers", e))?;
        Ok(())
    }

    async fn ensure_pv(&self, pv: &PersistentVolume) -> Result<(), ReconcileError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        let name = pv.name_any();
        if api
            .get_opt(&name)
            .await
            .map_err(|e| ReconcileError::kube(format!("failed to get PV {}", name), e))?
            .is_some()
        {
            return Ok(());
        }
        match api.create(&PostParams::default(), pv).await {
            Ok(_) => {
                info!(pv = %name, "Created agent PV");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(ReconcileError::kube(format!("failed to create PV {}", name), e)),
        }
    }

    async fn ensure_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<(), ReconcileError> {
        let namespace = pvc.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        let name = pvc.name_any();
        if api
            .get_opt(&name)
            .await
            .map_err(|e| ReconcileError::kube(format!("failed to get PVC {}", name), e))?
            .is_some()
        {
            return Ok(());
        }
        match api.create(&PostParams::default(), pvc).await {
            Ok(_) => {
                info!(pvc = %name, namespace = %namespace, "Created agent PVC");
                Ok(())
            }
            Err(e) if is_conflict(&e) => Ok(()),
            Err(e) => Err(ReconcileError::kube(format!("failed to create PVC {}", name), e)),
        }
    }

    async fn apply_daemonset(&self, daemonset: &DaemonSet) -> Result<(), ReconcileError> {
        let namespace = daemonset.namespace().unwrap_or_default();
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);
        let name = daemonset.name_any();
        let mut body = serde_json::to_value(daemonset)
            .map_err(|e| ReconcileError::Internal(format!("failed to encode DaemonSet: {}", e)))?;
        body["apiVersion"] = json!("apps/v1");
        body["kind"] = json!("DaemonSet");
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&body))
            .await
            .map_err(|e| ReconcileError::kube(format!("failed to apply DaemonSet {}", name), e))?;
        debug!(daemonset = %name, namespace = %namespace, "Agent DaemonSet applied");
        Ok(())
    }
}

/// Context for the node-group controller
pub struct NodeGroupContext {
    /// Kubernetes access
    pub kube: Arc<dyn NodeGroupKube>,
    /// Cluster-wide local model settings (agent image and resources)
    pub config: LocalModelConfig,
    /// Namespace the agents run in
    pub namespace: String,
}

impl NodeGroupContext {
    /// Create a context backed by a real client
    pub fn new(client: Client, config: LocalModelConfig, namespace: String) -> Self {
        Self {
            kube: Arc::new(NodeGroupKubeImpl::new(client)),
            config,
            namespace,
        }
    }
}

/// Error policy for the node-group controller.
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(
    group: Arc<LocalModelNodeGroup>,
    error: &ReconcileError,
    _ctx: Arc<NodeGroupContext>,
) -> Action {
    warn!(group = %group.name_any(), error = %error, "Node group reconcile error, will retry");
    Action::requeue(ERROR_REQUEUE)
}

/// Reconcile a LocalModelNodeGroup
#[instrument(skip(group, ctx), fields(group = %group.name_any()))]
pub async fn reconcile(
    group: Arc<LocalModelNodeGroup>,
    ctx: Arc<NodeGroupContext>,
) -> Result<Action, ReconcileError> {
    let timer = ReconcileTimer::start("LocalModelNodeGroup");
    let result = reconcile_inner(&group, &ctx).await;
    timer.finish(&result);
    result
}

async fn reconcile_inner(
    group: &LocalModelNodeGroup,
    ctx: &NodeGroupContext,
) -> Result<Action, ReconcileError> {
    let name = group.name_any();
    let finalizers = group.finalizers().to_vec();
    let has_finalizer = finalizers.iter().any(|f| f == NODE_GROUP_FINALIZER);

    if group.metadata.deletion_timestamp.is_some() {
        if has_finalizer {
            info!(group = %name, "Releasing deleted node group");
            let remaining = finalizers
                .into_iter()
                .filter(|f| f != NODE_GROUP_FINALIZER)
                .collect();
            ctx.kube
                .set_finalizers(&name, group.resource_version(), remaining)
                .await?;
        }
        return Ok(Action::await_change());
    }

    if !has_finalizer {
        let mut with_finalizer = finalizers;
        with_finalizer.push(NODE_GROUP_FINALIZER.to_string());
        ctx.kube
            .set_finalizers(&name, group.resource_version(), with_finalizer)
            .await?;
    }

    info!(group = %name, "Reconciling node group agent");
    let owner = controller_owner_ref(group);

    let pv = build_agent_pv(group, owner.clone());
    ctx.kube.ensure_pv(&pv).await?;

    let pvc = build_agent_pvc(group, &ctx.namespace, owner.clone());
    ctx.kube.ensure_pvc(&pvc).await?;

    let daemonset = build_agent_daemonset(group, &ctx.config, &ctx.namespace, owner)?;
    ctx.kube.apply_daemonset(&daemonset).await?;

    Ok(Action::await_change())
}

// =============================================================================
// Builders
// =============================================================================

fn agent_labels(group: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), agent_name(group)),
        ("app.kubernetes.io/instance".to_string(), group.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "lattice-model-cache".to_string(),
        ),
        ("app.kubernetes.io/component".to_string(), component.to_string()),
    ])
}

fn agent_metadata(
    group: &str,
    namespace: Option<&str>,
    component: &str,
    owner: Option<OwnerReference>,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(agent_name(group)),
        namespace: namespace.map(str::to_string),
        labels: Some(agent_labels(group, component)),
        owner_references: owner.map(|o| vec![o]),
        ..Default::default()
    }
}

/// Agent PV copied from the group's PV template
pub fn build_agent_pv(group: &LocalModelNodeGroup, owner: Option<OwnerReference>) -> PersistentVolume {
    PersistentVolume {
        metadata: agent_metadata(&group.name_any(), None, "local-model-agent-pv", owner),
        spec: Some(group.spec.persistent_volume_spec.clone()),
        ..Default::default()
    }
}

/// Agent PVC bound to the agent PV
pub fn build_agent_pvc(
    group: &LocalModelNodeGroup,
    namespace: &str,
    owner: Option<OwnerReference>,
) -> PersistentVolumeClaim {
    let name = group.name_any();
    let mut spec = group.spec.persistent_volume_claim_spec.clone();
    spec.volume_name = Some(agent_name(&name));
    PersistentVolumeClaim {
        metadata: agent_metadata(&name, Some(namespace), "local-model-agent-pvc", owner),
        spec: Some(spec),
        ..Default::default()
    }
}

fn downward_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn quantities(cpu: &str, memory: &str) -> Option<BTreeMap<String, Quantity>> {
    let mut list = BTreeMap::new();
    if !cpu.is_empty() {
        list.insert("cpu".to_string(), Quantity(cpu.to_string()));
    }
    if !memory.is_empty() {
        list.insert("memory".to_string(), Quantity(memory.to_string()));
    }
    (!list.is_empty()).then_some(list)
}

/// Agent DaemonSet scheduled onto the group's nodes
///
/// Fails when the group's PV has no required node affinity, since the agent
/// would otherwise land on every node in the cluster.
pub fn build_agent_daemonset(
    group: &LocalModelNodeGroup,
    config: &LocalModelConfig,
    namespace: &str,
    owner: Option<OwnerReference>,
) -> Result<DaemonSet, ReconcileError> {
    let name = group.name_any();
    let terms = group
        .spec
        .persistent_volume_spec
        .node_affinity
        .as_ref()
        .and_then(|a| a.required.as_ref())
        .map(|r| r.node_selector_terms.clone())
        .ok_or_else(|| {
            ReconcileError::Validation(format!(
                "node group {} has no required node affinity",
                name
            ))
        })?;

    let labels = agent_labels(&name, "local-model-agent");
    let container = Container {
        name: AGENT_CONTAINER.to_string(),
        image: Some(config.agent_image.clone()),
        image_pull_policy: Some(config.agent_image_pull_policy.clone())
            .filter(|p| !p.is_empty()),
        args: Some(vec!["agent".to_string()]),
        env: Some(vec![
            downward_env("POD_NAMESPACE", "metadata.namespace"),
            downward_env("NODE_NAME", "spec.nodeName"),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            allow_privilege_escalation: Some(false),
            run_as_non_root: Some(true),
            read_only_root_filesystem: Some(true),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        resources: Some(ResourceRequirements {
            requests: quantities(&config.agent_cpu_request, &config.agent_memory_request),
            limits: quantities(&config.agent_cpu_limit, &config.agent_memory_limit),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: MODELS_VOLUME.to_string(),
            mount_path: MODEL_MOUNT_PATH.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Ok(DaemonSet {
        metadata: agent_metadata(&name, Some(namespace), "local-model-agent", owner),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        "kubectl.kubernetes.io/default-container".to_string(),
                        AGENT_CONTAINER.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    affinity: Some(Affinity {
                        node_affinity: Some(NodeAffinity {
                            required_during_scheduling_ignored_during_execution: Some(
                                NodeSelector {
                                    node_selector_terms: terms,
                                },
                            ),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    service_account_name: Some(AGENT_SERVICE_ACCOUNT.to_string()),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        ..Default::default()
                    }),
                    termination_grace_period_seconds: Some(10),
                    volumes: Some(vec![Volume {
                        name: MODELS_VOLUME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: agent_name(&name),
                            read_only: Some(false),
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

//! LocalModelNode reconciler run by the per-node agent
//!
//! Each agent only acts on the `LocalModelNode` named after its own node:
//! - Prune download jobs for models no longer in spec
//! - Per model: derive status from the model folder and its latest job,
//!   launching a download job when needed (at most one retry)
//! - Persist `status.modelStatus` when it changed
//! - Remove model folders no longer in spec

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument, warn};

use lattice_common::affinity::node_matches_volume;
use lattice_common::crd::{
    ClusterStorageContainer, LocalModelInfo, LocalModelNode, ModelDownloadStatus,
};
use lattice_common::kube_utils::controller_owner_ref;
use lattice_common::metrics::{
    record_download_job_created, record_download_job_pruned, record_model_folder_removed,
    ReconcileTimer,
};
use lattice_common::{LocalModelConfig, ReconcileError};

use crate::client::{AgentKube, AgentKubeImpl};
use crate::filesystem::ModelFilesystem;
use crate::job::{
    build_download_job, download_job_name, job_belongs_to, job_status, latest_job,
    node_job_selector, resolve_container, should_launch_job, DownloadJobParams,
};

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Context for the node agent controller
pub struct AgentContext {
    /// Kubernetes access
    pub kube: Arc<dyn AgentKube>,
    /// The node's model root
    pub fs: Arc<dyn ModelFilesystem>,
    /// Name of the node this agent runs on
    pub node_name: String,
    /// Cluster-wide local model settings
    pub config: LocalModelConfig,
}

impl AgentContext {
    /// Create a context backed by a real client
    pub fn new(
        client: Client,
        fs: Arc<dyn ModelFilesystem>,
        node_name: impl Into<String>,
        config: LocalModelConfig,
    ) -> Self {
        Self::with_kube(Arc::new(AgentKubeImpl::new(client)), fs, node_name, config)
    }

    /// Create a context with a custom Kubernetes implementation
    pub fn with_kube(
        kube: Arc<dyn AgentKube>,
        fs: Arc<dyn ModelFilesystem>,
        node_name: impl Into<String>,
        config: LocalModelConfig,
    ) -> Self {
        Self {
            kube,
            fs,
            node_name: node_name.into(),
            config,
        }
    }
}

/// Error policy for the agent controller
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy(
    node: Arc<LocalModelNode>,
    error: &ReconcileError,
    _ctx: Arc<AgentContext>,
) -> Action {
    warn!(
        node = %node.name_any(),
        error = %error,
        "LocalModelNode reconcile error, will retry"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Reconcile this node's LocalModelNode
#[instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub async fn reconcile(
    node: Arc<LocalModelNode>,
    ctx: Arc<AgentContext>,
) -> Result<Action, ReconcileError> {
    if node.name_any() != ctx.node_name {
        debug!("LocalModelNode belongs to another node, ignoring");
        return Ok(Action::await_change());
    }

    let timer = ReconcileTimer::start("LocalModelNode");
    let result = reconcile_node(&node, &ctx).await;
    timer.finish(&result);
    result
}

async fn reconcile_node(
    node: &LocalModelNode,
    ctx: &AgentContext,
) -> Result<Action, ReconcileError> {
    let models = &node.spec.local_models;
    debug!(models = models.len(), "Reconciling LocalModelNode");

    let jobs = ctx
        .kube
        .list_jobs(&node_job_selector(&ctx.node_name))
        .await?;
    let jobs = prune_stale_jobs(ctx, models, jobs).await;

    let previous = node
        .status
        .as_ref()
        .map(|s| s.model_status.clone())
        .unwrap_or_default();
    let mut launcher = JobLauncher::new(ctx, controller_owner_ref(node));
    let mut current = BTreeMap::new();

    for info in models {
        let key = info.status_key();
        match model_status(ctx, &mut launcher, info, previous.get(&key).copied(), &jobs).await {
            Ok(status) => {
                current.insert(key, status);
            }
            Err(e) => {
                warn!(model = %key, error = %e, "Failed to reconcile model, keeping last status");
                if let Some(status) = previous.get(&key) {
                    current.insert(key, *status);
                }
            }
        }
    }

    if current != previous {
        info!(models = current.len(), "Updating model download status");
        ctx.kube
            .patch_model_status(&ctx.node_name, &previous, &current)
            .await?;
    }

    remove_stray_folders(ctx, models).await?;

    Ok(Action::requeue(ctx.config.reconciliation_frequency()))
}

/// Delete jobs whose model left the spec, returning the jobs that remain
async fn prune_stale_jobs(
    ctx: &AgentContext,
    models: &[LocalModelInfo],
    jobs: Vec<Job>,
) -> Vec<Job> {
    let (keep, stale): (Vec<Job>, Vec<Job>) = jobs.into_iter().partition(|job| {
        models
            .iter()
            .any(|info| job_belongs_to(job, info, &ctx.config))
    });

    for job in stale {
        let name = job.name_any();
        let namespace = job.namespace().unwrap_or_default();
        match ctx.kube.delete_job(&namespace, &name).await {
            Ok(()) => {
                info!(job = %name, namespace = %namespace, "Deleted download job for removed model");
                record_download_job_pruned(&ctx.node_name);
            }
            Err(e) => {
                warn!(job = %name, namespace = %namespace, error = %e, "Failed to delete stale download job");
            }
        }
    }
    keep
}

/// Derive one model's status, launching a download job when required
async fn model_status(
    ctx: &AgentContext,
    launcher: &mut JobLauncher<'_>,
    info: &LocalModelInfo,
    previous: Option<ModelDownloadStatus>,
    jobs: &[Job],
) -> Result<ModelDownloadStatus, ReconcileError> {
    let model_jobs: Vec<&Job> = jobs
        .iter()
        .filter(|job| job_belongs_to(job, info, &ctx.config))
        .collect();
    let latest = latest_job(&model_jobs);

    if ctx.fs.has_model_folder(&info.folder_name()).await? {
        // Completed jobs may already be gone after their TTL
        if previous == Some(ModelDownloadStatus::Downloaded) {
            return Ok(ModelDownloadStatus::Downloaded);
        }
        return match latest {
            Some(job) => Ok(job_status(job)),
            None => {
                launcher.launch(info, model_jobs.len()).await?;
                Ok(ModelDownloadStatus::Pending)
            }
        };
    }

    if should_launch_job(latest, model_jobs.len()) {
        launcher.launch(info, model_jobs.len()).await?;
        return Ok(ModelDownloadStatus::Pending);
    }
    Ok(latest.map(job_status).unwrap_or_default())
}

/// Remove model folders that no model in spec maps to
async fn remove_stray_folders(
    ctx: &AgentContext,
    models: &[LocalModelInfo],
) -> Result<(), ReconcileError> {
    let wanted: BTreeSet<String> = models.iter().map(LocalModelInfo::folder_name).collect();
    for folder in ctx.fs.model_folders().await? {
        if wanted.contains(&folder) {
            continue;
        }
        match ctx.fs.remove_model(&folder).await {
            Ok(()) => {
                info!(folder = %folder, "Removed model folder no longer in spec");
                record_model_folder_removed(&ctx.node_name);
            }
            Err(e) => warn!(folder = %folder, error = %e, "Failed to remove model folder"),
        }
    }
    Ok(())
}

// =============================================================================
// Job launching
// =============================================================================

/// Creates download jobs, resolving the node group and storage containers
/// at most once per reconcile
struct JobLauncher<'a> {
    ctx: &'a AgentContext,
    owner: Option<OwnerReference>,
    node_group: Option<Result<String, ReconcileError>>,
    containers: Option<Result<Vec<ClusterStorageContainer>, ReconcileError>>,
}

impl<'a> JobLauncher<'a> {
    fn new(ctx: &'a AgentContext, owner: Option<OwnerReference>) -> Self {
        Self {
            ctx,
            owner,
            node_group: None,
            containers: None,
        }
    }

    async fn launch(&mut self, info: &LocalModelInfo, attempt: usize) -> Result<(), ReconcileError> {
        let ctx = self.ctx;
        let node_group = self.node_group().await?;
        let container = resolve_container(
            self.containers().await?,
            &info.source_model_uri,
            &ctx.config.default_job_image,
        )?;
        let name = download_job_name(&info.model_name, &ctx.node_name, attempt);
        let job = build_download_job(
            DownloadJobParams {
                info,
                node_name: &ctx.node_name,
                node_group: &node_group,
                name: name.clone(),
                container,
                owner: self.owner.clone(),
            },
            &ctx.config,
        )?;
        let namespace = job.namespace().unwrap_or_default();

        ctx.kube.create_job(&namespace, &job).await?;
        info!(
            job = %name,
            namespace = %namespace,
            model = %info.status_key(),
            node_group = %node_group,
            "Launched model download job"
        );
        record_download_job_created(&ctx.node_name);
        Ok(())
    }

    async fn node_group(&mut self) -> Result<String, ReconcileError> {
        if let Some(resolved) = &self.node_group {
            return resolved.clone();
        }
        let resolved = find_node_group(self.ctx).await;
        self.node_group = Some(resolved.clone());
        resolved
    }

    async fn containers(&mut self) -> Result<&[ClusterStorageContainer], ReconcileError> {
        if self.containers.is_none() {
            self.containers = Some(self.ctx.kube.list_storage_containers().await);
        }
        match &self.containers {
            Some(Ok(containers)) => Ok(containers),
            Some(Err(e)) => Err(e.clone()),
            None => Ok(&[]),
        }
    }
}

/// First node group (by name) whose volume affinity selects this node
async fn find_node_group(ctx: &AgentContext) -> Result<String, ReconcileError> {
    let node = ctx.kube.get_node(&ctx.node_name).await?.ok_or_else(|| {
        ReconcileError::Config(format!("node {} not found", ctx.node_name))
    })?;

    let mut groups = ctx.kube.list_node_groups().await?;
    groups.sort_by_key(|g| g.name_any());
    for group in &groups {
        match node_matches_volume(&group.spec.persistent_volume_spec, &node) {
            Ok(true) => return Ok(group.name_any()),
            Ok(false) => {}
            Err(e) => {
                warn!(node_group = %group.name_any(), error = %e, "Skipping node group with invalid affinity");
            }
        }
    }
    Err(ReconcileError::Config(format!(
        "node {} does not belong to any node group",
        ctx.node_name
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockAgentKube;
    use crate::filesystem::memory::MemoryFilesystem;
    use crate::job::tests::{existing_job, model};
    use k8s_openapi::api::core::v1::{
        Node, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeSpec,
        VolumeNodeAffinity,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use lattice_common::crd::{
        LocalModelNodeGroup, LocalModelNodeGroupSpec, LocalModelNodeSpec, LocalModelNodeStatus,
    };

    const NODE: &str = "worker";

    fn local_model_node(
        name: &str,
        models: Vec<LocalModelInfo>,
        status: &[(&str, ModelDownloadStatus)],
    ) -> LocalModelNode {
        let mut lmn = LocalModelNode::new(
            name,
            LocalModelNodeSpec {
                local_models: models,
            },
        );
        lmn.metadata.uid = Some("lmn-uid".to_string());
        if !status.is_empty() {
            lmn.status = Some(LocalModelNodeStatus {
                model_status: status
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            });
        }
        lmn
    }

    fn worker_node() -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(NODE.to_string()),
                labels: Some(BTreeMap::from([(
                    "node.kubernetes.io/instance-type".to_string(),
                    "gpu-large".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn node_group(name: &str, instance_type: &str) -> LocalModelNodeGroup {
        LocalModelNodeGroup::new(
            name,
            LocalModelNodeGroupSpec {
                persistent_volume_spec: PersistentVolumeSpec {
                    node_affinity: Some(VolumeNodeAffinity {
                        required: Some(NodeSelector {
                            node_selector_terms: vec![NodeSelectorTerm {
                                match_expressions: Some(vec![NodeSelectorRequirement {
                                    key: "node.kubernetes.io/instance-type".to_string(),
                                    operator: "In".to_string(),
                                    values: Some(vec![instance_type.to_string()]),
                                }]),
                                match_fields: None,
                            }],
                        }),
                    }),
                    ..Default::default()
                },
                persistent_volume_claim_spec: Default::default(),
            },
        )
    }

    /// Node and node group lookups for a worker in group "gpu"
    fn expect_gpu_worker(kube: &mut MockAgentKube) {
        kube.expect_get_node()
            .returning(|_| Ok(Some(worker_node())));
        kube.expect_list_node_groups().returning(|| {
            Ok(vec![
                node_group("cpu", "cpu-small"),
                node_group("gpu", "gpu-large"),
            ])
        });
        kube.expect_list_storage_containers()
            .returning(|| Ok(Vec::new()));
    }

    fn ctx(kube: MockAgentKube, fs: Arc<MemoryFilesystem>) -> Arc<AgentContext> {
        Arc::new(AgentContext::with_kube(
            Arc::new(kube),
            fs,
            NODE,
            LocalModelConfig::default(),
        ))
    }

    fn resync() -> Action {
        Action::requeue(LocalModelConfig::default().reconciliation_frequency())
    }

    mod identity {
        use super::*;

        #[tokio::test]
        async fn other_nodes_are_ignored() {
            // Any API call would panic on the empty mock
            let lmn = local_model_node("other", vec![model("iris", "")], &[]);
            let action = reconcile(
                Arc::new(lmn),
                ctx(MockAgentKube::new(), Arc::new(MemoryFilesystem::default())),
            )
            .await
            .unwrap();
            assert_eq!(action, Action::await_change());
        }
    }

    mod downloads {
        use super::*;

        #[tokio::test]
        async fn first_reconcile_launches_job() {
            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs()
                .withf(|selector| selector.starts_with("node=worker"))
                .returning(|_| Ok(Vec::new()));
            expect_gpu_worker(&mut kube);
            kube.expect_create_job()
                .withf(|ns, job| {
                    let claim = job.spec.as_ref().unwrap().template.spec.as_ref().unwrap()
                        .volumes.as_ref().unwrap()[0]
                        .persistent_volume_claim.as_ref().unwrap()
                        .claim_name.clone();
                    ns == "lattice-local-model-jobs"
                        && job.name_any() == "iris-worker"
                        && claim == "iris-gpu"
                        && job.owner_references()[0].name == NODE
                })
                .times(1)
                .returning(|_, _| Ok(()));
            kube.expect_patch_model_status()
                .withf(|name, previous, current| {
                    name == NODE
                        && previous.is_empty()
                        && current.get("iris") == Some(&ModelDownloadStatus::Pending)
                })
                .times(1)
                .returning(|_, _, _| Ok(()));

            let lmn = local_model_node(NODE, vec![model("iris", "")], &[]);
            let action = reconcile(
                Arc::new(lmn),
                ctx(kube, Arc::new(MemoryFilesystem::default())),
            )
            .await
            .unwrap();
            assert_eq!(action, resync());
        }

        #[tokio::test]
        async fn succeeded_job_marks_model_downloaded() {
            let info = model("iris", "");
            let job = existing_job(&info, NODE, 0, 1, 0);

            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs()
                .returning(move |_| Ok(vec![job.clone()]));
            kube.expect_create_job().never();
            kube.expect_patch_model_status()
                .withf(|_, previous, current| {
                    previous.get("iris") == Some(&ModelDownloadStatus::Pending)
                        && current.get("iris") == Some(&ModelDownloadStatus::Downloaded)
                })
                .times(1)
                .returning(|_, _, _| Ok(()));

            let lmn = local_model_node(NODE, vec![info], &[("iris", ModelDownloadStatus::Pending)]);
            let fs = Arc::new(MemoryFilesystem::with_folders(&["iris"]));
            reconcile(Arc::new(lmn), ctx(kube, fs)).await.unwrap();
        }

        #[tokio::test]
        async fn downloaded_model_is_left_alone_after_job_expired() {
            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs().returning(|_| Ok(Vec::new()));
            kube.expect_create_job().never();
            kube.expect_patch_model_status().never();

            let lmn = local_model_node(
                NODE,
                vec![model("iris", "")],
                &[("iris", ModelDownloadStatus::Downloaded)],
            );
            let fs = Arc::new(MemoryFilesystem::with_folders(&["iris"]));
            let action = reconcile(Arc::new(lmn), ctx(kube, fs)).await.unwrap();
            assert_eq!(action, resync());
        }

        #[tokio::test]
        async fn running_job_reports_downloading() {
            let info = model("iris", "");
            let mut job = existing_job(&info, NODE, 0, 0, 0);
            job.status.as_mut().unwrap().ready = Some(1);

            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs()
                .returning(move |_| Ok(vec![job.clone()]));
            kube.expect_create_job().never();
            kube.expect_patch_model_status()
                .withf(|_, _, current| {
                    current.get("iris") == Some(&ModelDownloadStatus::Downloading)
                })
                .times(1)
                .returning(|_, _, _| Ok(()));

            let lmn = local_model_node(NODE, vec![info], &[("iris", ModelDownloadStatus::Pending)]);
            let fs = Arc::new(MemoryFilesystem::with_folders(&["iris"]));
            reconcile(Arc::new(lmn), ctx(kube, fs)).await.unwrap();
        }

        #[tokio::test]
        async fn namespaced_model_job_runs_in_model_namespace() {
            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs().returning(|_| Ok(Vec::new()));
            expect_gpu_worker(&mut kube);
            kube.expect_create_job()
                .withf(|ns, job| ns == "team-a" && job.name_any() == "bert-worker")
                .times(1)
                .returning(|_, _| Ok(()));
            kube.expect_patch_model_status()
                .withf(|_, _, current| {
                    current.get("team-a/bert") == Some(&ModelDownloadStatus::Pending)
                })
                .times(1)
                .returning(|_, _, _| Ok(()));

            let lmn = local_model_node(NODE, vec![model("bert", "team-a")], &[]);
            reconcile(
                Arc::new(lmn),
                ctx(kube, Arc::new(MemoryFilesystem::default())),
            )
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn node_outside_every_group_launches_nothing() {
            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs().returning(|_| Ok(Vec::new()));
            kube.expect_get_node()
                .returning(|_| Ok(Some(worker_node())));
            kube.expect_list_node_groups()
                .returning(|| Ok(vec![node_group("cpu", "cpu-small")]));
            kube.expect_create_job().never();
            kube.expect_patch_model_status().never();

            let lmn = local_model_node(NODE, vec![model("iris", "")], &[]);
            let action = reconcile(
                Arc::new(lmn),
                ctx(kube, Arc::new(MemoryFilesystem::default())),
            )
            .await
            .unwrap();
            assert_eq!(action, resync());
        }
    }

    mod bounded_retry {
        use super::*;

        #[tokio::test]
        async fn removed_output_gets_one_more_job() {
            let info = model("iris", "");
            let first = existing_job(&info, NODE, 0, 1, 0);

            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs()
                .returning(move |_| Ok(vec![first.clone()]));
            expect_gpu_worker(&mut kube);
            kube.expect_create_job()
                .withf(|_, job| job.name_any() == "iris-worker-1")
                .times(1)
                .returning(|_, _| Ok(()));
            kube.expect_patch_model_status()
                .withf(|_, _, current| current.get("iris") == Some(&ModelDownloadStatus::Pending))
                .times(1)
                .returning(|_, _, _| Ok(()));

            let lmn = local_model_node(
                NODE,
                vec![info],
                &[("iris", ModelDownloadStatus::Downloaded)],
            );
            reconcile(
                Arc::new(lmn),
                ctx(kube, Arc::new(MemoryFilesystem::default())),
            )
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn no_third_job() {
            let info = model("iris", "");
            let jobs = vec![
                existing_job(&info, NODE, 0, 1, 0),
                existing_job(&info, NODE, 1, 1, 0),
            ];

            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs()
                .returning(move |_| Ok(jobs.clone()));
            kube.expect_create_job().never();
            kube.expect_patch_model_status().never();

            let lmn = local_model_node(
                NODE,
                vec![info],
                &[("iris", ModelDownloadStatus::Downloaded)],
            );
            reconcile(
                Arc::new(lmn),
                ctx(kube, Arc::new(MemoryFilesystem::default())),
            )
            .await
            .unwrap();
        }

        #[tokio::test]
        async fn failed_job_is_not_retried() {
            let info = model("iris", "");
            let failed = existing_job(&info, NODE, 0, 0, 1);

            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs()
                .returning(move |_| Ok(vec![failed.clone()]));
            kube.expect_create_job().never();
            kube.expect_patch_model_status()
                .withf(|_, _, current| current.get("iris") == Some(&ModelDownloadStatus::Error))
                .times(1)
                .returning(|_, _, _| Ok(()));

            let lmn = local_model_node(NODE, vec![info], &[("iris", ModelDownloadStatus::Pending)]);
            reconcile(
                Arc::new(lmn),
                ctx(kube, Arc::new(MemoryFilesystem::default())),
            )
            .await
            .unwrap();
        }
    }

    mod cleanup {
        use super::*;

        #[tokio::test]
        async fn jobs_for_removed_models_are_pruned() {
            let iris = model("iris", "");
            let stale = existing_job(&model("bert", ""), NODE, 0, 1, 0);

            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs()
                .returning(move |_| Ok(vec![stale.clone()]));
            kube.expect_delete_job()
                .withf(|ns, name| ns == "lattice-local-model-jobs" && name == "bert-worker")
                .times(1)
                .returning(|_, _| Ok(()));
            kube.expect_create_job().never();
            kube.expect_patch_model_status().never();

            let lmn = local_model_node(NODE, vec![iris], &[("iris", ModelDownloadStatus::Downloaded)]);
            let fs = Arc::new(MemoryFilesystem::with_folders(&["iris"]));
            reconcile(Arc::new(lmn), ctx(kube, fs)).await.unwrap();
        }

        #[tokio::test]
        async fn stray_folders_are_removed_and_status_dropped() {
            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs().returning(|_| Ok(Vec::new()));
            kube.expect_patch_model_status()
                .withf(|_, previous, current| {
                    previous.contains_key("team-a/bert")
                        && !current.contains_key("team-a/bert")
                        && current.get("iris") == Some(&ModelDownloadStatus::Downloaded)
                })
                .times(1)
                .returning(|_, _, _| Ok(()));

            let lmn = local_model_node(
                NODE,
                vec![model("iris", "")],
                &[
                    ("iris", ModelDownloadStatus::Downloaded),
                    ("team-a/bert", ModelDownloadStatus::Downloaded),
                ],
            );
            let fs = Arc::new(MemoryFilesystem::with_folders(&["iris", "team-a_bert"]));
            reconcile(Arc::new(lmn), ctx(kube, fs.clone())).await.unwrap();
            assert_eq!(fs.removed(), vec!["team-a_bert".to_string()]);
        }

        #[tokio::test]
        async fn status_write_failure_is_returned() {
            let mut kube = MockAgentKube::new();
            kube.expect_list_jobs().returning(|_| Ok(Vec::new()));
            expect_gpu_worker(&mut kube);
            kube.expect_create_job().returning(|_, _| Ok(()));
            kube.expect_patch_model_status()
                .returning(|_, _, _| Err(ReconcileError::Kube("conflict".into())));

            let lmn = local_model_node(NODE, vec![model("iris", "")], &[]);
            let fs = Arc::new(MemoryFilesystem::with_folders(&["old"]));
            let err = reconcile(Arc::new(lmn), ctx(kube, fs.clone()))
                .await
                .unwrap_err();
            assert!(matches!(err, ReconcileError::Kube(_)));
            assert!(fs.removed().is_empty());
        }
    }

    #[test]
    fn error_policy_requeues() {
        let lmn = Arc::new(local_model_node(NODE, Vec::new(), &[]));
        let action = error_policy(
            lmn,
            &ReconcileError::Kube("boom".into()),
            ctx(MockAgentKube::new(), Arc::new(MemoryFilesystem::default())),
        );
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }
}

//! Download Job construction and status derivation
//!
//! Builds Kubernetes Jobs that copy a model from its source URI into the node
//! group volume. Each Job is pinned to one node, mounts the model's download
//! PVC at a per-model subpath and is owned by the node's `LocalModelNode`.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::ResourceExt;

use lattice_common::crd::{ClusterStorageContainer, LocalModelInfo, ModelDownloadStatus};
use lattice_common::{LocalModelConfig, ReconcileError, MODELS_SUBDIR, MODEL_MOUNT_PATH};

/// Most jobs ever launched for one (model, node) pair
///
/// The second job only runs after the first succeeded and its output was
/// removed from disk. Failed jobs are never retried automatically.
pub const MAX_DOWNLOAD_JOBS: usize = 2;

/// Job label carrying the model name
pub const MODEL_LABEL: &str = "model";

/// Job label carrying the node name
pub const NODE_LABEL: &str = "node";

/// Job label carrying the namespace of a namespace-scoped model
pub const MODEL_NAMESPACE_LABEL: &str = "model-namespace";

/// Value of `app.kubernetes.io/managed-by` on download jobs
pub const MANAGED_BY: &str = "lattice-model-agent";

/// Name of the downloader container when no storage container matches
const DEFAULT_CONTAINER_NAME: &str = "storage-initializer";

/// Volume name of the node group claim inside the job pod
const MODEL_VOLUME: &str = "models";

/// Name of the `attempt`-th job (zero based) for a model on a node
pub fn download_job_name(model_name: &str, node_name: &str, attempt: usize) -> String {
    if attempt == 0 {
        format!("{}-{}", model_name, node_name)
    } else {
        format!("{}-{}-{}", model_name, node_name, attempt)
    }
}

/// Namespace download jobs for a model run in
pub fn job_namespace_for(info: &LocalModelInfo, config: &LocalModelConfig) -> String {
    if info.is_namespaced() {
        info.namespace.clone()
    } else {
        config.job_namespace.clone()
    }
}

/// Label selector matching every download job the agent created on a node
pub fn node_job_selector(node_name: &str) -> String {
    format!(
        "{}={},app.kubernetes.io/managed-by={}",
        NODE_LABEL, node_name, MANAGED_BY
    )
}

/// Whether `job` downloads `info` (same model label, namespace and scope)
pub fn job_belongs_to(job: &Job, info: &LocalModelInfo, config: &LocalModelConfig) -> bool {
    let labels = job.labels();
    let model_namespace = labels
        .get(MODEL_NAMESPACE_LABEL)
        .map(String::as_str)
        .unwrap_or_default();
    labels.get(MODEL_LABEL) == Some(&info.model_name)
        && model_namespace == info.namespace
        && job.namespace().as_deref() == Some(job_namespace_for(info, config).as_str())
}

/// Most recently created job in `jobs`
pub fn latest_job<'a>(jobs: &[&'a Job]) -> Option<&'a Job> {
    jobs.iter()
        .copied()
        .max_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
}

/// Download status reported for a job
///
/// Success wins over failure so a job that succeeded after retried pods is
/// reported as downloaded.
pub fn job_status(job: &Job) -> ModelDownloadStatus {
    let Some(status) = job.status.as_ref() else {
        return ModelDownloadStatus::Pending;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        ModelDownloadStatus::Downloaded
    } else if status.failed.unwrap_or(0) > 0 {
        ModelDownloadStatus::Error
    } else if status.ready.unwrap_or(0) > 0 {
        ModelDownloadStatus::Downloading
    } else {
        ModelDownloadStatus::Pending
    }
}

/// Whether a new job should be launched for a model whose folder is missing
///
/// A first job is always launched. Afterwards only a succeeded latest job
/// earns another attempt, and only while under [`MAX_DOWNLOAD_JOBS`].
pub fn should_launch_job(latest: Option<&Job>, total: usize) -> bool {
    match latest {
        None => true,
        Some(job) => {
            job_status(job) == ModelDownloadStatus::Downloaded && total < MAX_DOWNLOAD_JOBS
        }
    }
}

/// Downloader container for `uri`
///
/// Uses the first storage container that serves download jobs for the URI,
/// falling back to `default_image`. An invalid URI pattern is a configuration
/// error.
pub fn resolve_container(
    containers: &[ClusterStorageContainer],
    uri: &str,
    default_image: &str,
) -> Result<Container, ReconcileError> {
    for candidate in containers {
        if candidate.spec.serves_download_of(uri)? {
            return Ok(candidate.spec.container.clone());
        }
    }
    Ok(Container {
        name: DEFAULT_CONTAINER_NAME.to_string(),
        image: Some(default_image.to_string()),
        ..Default::default()
    })
}

/// Inputs of [`build_download_job`]
pub struct DownloadJobParams<'a> {
    /// Model to download
    pub info: &'a LocalModelInfo,
    /// Node the job is pinned to
    pub node_name: &'a str,
    /// Node group the node belongs to (selects the download claim)
    pub node_group: &'a str,
    /// Job name
    pub name: String,
    /// Downloader container
    pub container: Container,
    /// Controller reference to the node's `LocalModelNode`
    pub owner: Option<OwnerReference>,
}

fn storage_env(info: &LocalModelInfo) -> Result<Vec<EnvVar>, ReconcileError> {
    let mut env = Vec::new();
    let Some(storage) = info.storage.as_ref() else {
        return Ok(env);
    };
    if let Some(key) = storage.key.as_ref() {
        env.push(EnvVar {
            name: "STORAGE_KEY".to_string(),
            value: Some(key.clone()),
            ..Default::default()
        });
    }
    if let Some(parameters) = storage.parameters.as_ref().filter(|p| !p.is_empty()) {
        let raw = serde_json::to_string(parameters).map_err(|e| {
            ReconcileError::Internal(format!("failed to encode storage parameters: {}", e))
        })?;
        env.push(EnvVar {
            name: "STORAGE_OVERRIDE_CONFIG".to_string(),
            value: Some(raw),
            ..Default::default()
        });
    }
    Ok(env)
}

/// Build the download Job for a model on a node
///
/// The Job:
/// - Runs the downloader with `[<source uri>, /mnt/models]`
/// - Mounts the model's download PVC at `/mnt/models`, subpath `models/<folder>`
/// - Is pinned to the node via `nodeName`
/// - Restarts failed pods in place and expires after the configured TTL
pub fn build_download_job(
    params: DownloadJobParams<'_>,
    config: &LocalModelConfig,
) -> Result<Job, ReconcileError> {
    let info = params.info;
    let namespace = job_namespace_for(info, config);

    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(MODEL_LABEL.to_string(), info.model_name.clone());
    labels.insert(NODE_LABEL.to_string(), params.node_name.to_string());
    if info.is_namespaced() {
        labels.insert(MODEL_NAMESPACE_LABEL.to_string(), info.namespace.clone());
    }

    let mut container = params.container;
    container.args = Some(vec![
        info.source_model_uri.clone(),
        MODEL_MOUNT_PATH.to_string(),
    ]);
    container.volume_mounts = Some(vec![VolumeMount {
        name: MODEL_VOLUME.to_string(),
        mount_path: MODEL_MOUNT_PATH.to_string(),
        sub_path: Some(format!("{}/{}", MODELS_SUBDIR, info.folder_name())),
        ..Default::default()
    }]);
    let env = storage_env(info)?;
    if !env.is_empty() {
        container.env.get_or_insert_with(Vec::new).extend(env);
    }

    let volume = Volume {
        name: MODEL_VOLUME.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: info.download_pvc_name(params.node_group),
            read_only: Some(false),
        }),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(params.name),
            namespace: Some(namespace),
            labels: Some(labels.clone()),
            owner_references: params.owner.map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            ttl_seconds_after_finished: Some(config.job_ttl_seconds_after_finished),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    node_name: Some(params.node_name.to_string()),
                    containers: vec![container],
                    volumes: Some(vec![volume]),
                    restart_policy: Some("OnFailure".to_string()),
                    service_account_name: info.service_account_name.clone(),
                    security_context: config.fs_group.map(|group| PodSecurityContext {
                        fs_group: Some(group),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

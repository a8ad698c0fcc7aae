//! Download and serving volume construction
//!
//! Both volume kinds are copies of the node group's PV/PVC templates; only
//! names, namespaces, owner references and the claim's `volumeName` differ.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use lattice_common::crd::LocalModelNodeGroup;

use crate::client::CacheKube;
use crate::scope::{CacheScope, VolumeTarget};

/// Label carrying the cache name on every volume the controllers create
pub const CACHE_LABEL: &str = "lattice.dev/local-model-cache";

/// Label carrying the namespace of a namespace-scoped cache
pub const CACHE_NAMESPACE_LABEL: &str = "lattice.dev/local-model-cache-namespace";

pub(crate) fn volume_labels(scope: &CacheScope) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(CACHE_LABEL.to_string(), scope.name.clone());
    if let Some(ns) = &scope.namespace {
        labels.insert(CACHE_NAMESPACE_LABEL.to_string(), ns.clone());
    }
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "lattice-model-cache".to_string(),
    );
    labels
}

/// Build a PV named `name` from the node group's PV template
pub fn build_pv(scope: &CacheScope, group: &LocalModelNodeGroup, name: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(volume_labels(scope)),
            owner_references: Some(scope.owner_references_for(VolumeTarget::Volume))
                .filter(|refs| !refs.is_empty()),
            ..Default::default()
        },
        spec: Some(group.spec.persistent_volume_spec.clone()),
        ..Default::default()
    }
}

/// Build a PVC from the node group's PVC template, bound to `volume_name`
pub fn build_pvc(
    scope: &CacheScope,
    group: &LocalModelNodeGroup,
    name: &str,
    namespace: &str,
    volume_name: &str,
) -> PersistentVolumeClaim {
    let mut spec = group.spec.persistent_volume_claim_spec.clone();
    spec.volume_name = Some(volume_name.to_string());
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(volume_labels(scope)),
            owner_references: Some(scope.owner_references_for(VolumeTarget::Claim(namespace)))
                .filter(|refs| !refs.is_empty()),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Whether a volume was created for `scope`
///
/// Serving volumes of a cluster cache and a namespace cache with the same
/// name share names, so deletion checks the labels first.
pub fn created_for(scope: &CacheScope, labels: &BTreeMap<String, String>) -> bool {
    let same_scope = labels.get(CACHE_NAMESPACE_LABEL) == scope.namespace.as_ref();
    same_scope && labels.get(CACHE_LABEL) == Some(&scope.name)
}

/// Create the PV unless it already exists. Errors are logged, not returned.
pub async fn ensure_pv(kube: &dyn CacheKube, pv: &PersistentVolume) {
    let name = pv.name_any();
    match kube.get_pv(&name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(pv = %name, "Creating PV");
            if let Err(e) = kube.create_pv(pv).await {
                warn!(pv = %name, error = %e, "Failed to create PV");
            }
        }
        Err(e) => warn!(pv = %name, error = %e, "Failed to get PV"),
    }
}

/// Create the PVC unless it already exists. Errors are logged, not returned.
pub async fn ensure_pvc(kube: &dyn CacheKube, pvc: &PersistentVolumeClaim) {
    let name = pvc.name_any();
    let namespace = pvc.namespace().unwrap_or_default();
    match kube.get_pvc(&namespace, &name).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(pvc = %name, namespace = %namespace, "Creating PVC");
            if let Err(e) = kube.create_pvc(&namespace, pvc).await {
                warn!(pvc = %name, namespace = %namespace, error = %e, "Failed to create PVC");
            }
        }
        Err(e) => warn!(pvc = %name, namespace = %namespace, error = %e, "Failed to get PVC"),
    }
}

/// Create the download PV/PVC pair for every node group
pub async fn ensure_download_volumes(
    kube: &dyn CacheKube,
    scope: &CacheScope,
    groups: &[LocalModelNodeGroup],
    job_namespace: &str,
) {
    let namespace = scope.download_namespace(job_namespace);
    for group in groups {
        let group_name = group.name_any();
        let pv_name = scope.download_pv_name(&group_name);
        ensure_pv(kube, &build_pv(scope, group, &pv_name)).await;

        let pvc_name = scope.download_pvc_name(&group_name);
        ensure_pvc(kube, &build_pvc(scope, group, &pvc_name, namespace, &pv_name)).await;
    }
}

/// Create the serving PV/PVC pair for one node group and consuming namespace
pub async fn ensure_serving_volumes(
    kube: &dyn CacheKube,
    scope: &CacheScope,
    group: &LocalModelNodeGroup,
    consumer_namespace: &str,
) {
    let group_name = group.name_any();
    let pv_name = scope.serving_pv_name(&group_name, consumer_namespace);
    ensure_pv(kube, &build_pv(scope, group, &pv_name)).await;

    let pvc_name = scope.serving_pvc_name(&group_name);
    ensure_pvc(
        kube,
        &build_pvc(scope, group, &pvc_name, consumer_namespace, &pv_name),
    )
    .await;
}

/// Delete the serving PV/PVC pair for one node group and namespace
///
/// The claim is kept when it is really the download claim of a cluster cache.
/// Volumes labeled for another cache are left alone.
pub async fn delete_serving_volumes(
    kube: &dyn CacheKube,
    scope: &CacheScope,
    group_name: &str,
    consumer_namespace: &str,
    job_namespace: &str,
) {
    if !scope.serving_claim_is_download_claim(consumer_namespace, job_namespace) {
        let pvc_name = scope.serving_pvc_name(group_name);
        match kube.get_pvc(consumer_namespace, &pvc_name).await {
            Ok(Some(pvc)) if created_for(scope, pvc.labels()) => {
                info!(pvc = %pvc_name, namespace = %consumer_namespace, "Deleting serving PVC");
                if let Err(e) = kube.delete_pvc(consumer_namespace, &pvc_name).await {
                    warn!(pvc = %pvc_name, namespace = %consumer_namespace, error = %e, "Failed to delete serving PVC");
                }
            }
            Ok(Some(_)) => {
                debug!(pvc = %pvc_name, namespace = %consumer_namespace, "Serving PVC belongs to another cache, keeping it")
            }
            Ok(None) => {}
            Err(e) => {
                warn!(pvc = %pvc_name, namespace = %consumer_namespace, error = %e, "Failed to get serving PVC")
            }
        }
    }

    let pv_name = scope.serving_pv_name(group_name, consumer_namespace);
    match kube.get_pv(&pv_name).await {
        Ok(Some(pv)) if created_for(scope, pv.labels()) => {
            info!(pv = %pv_name, "Deleting serving PV");
            if let Err(e) = kube.delete_pv(&pv_name).await {
                warn!(pv = %pv_name, error = %e, "Failed to delete serving PV");
            }
        }
        Ok(Some(_)) => debug!(pv = %pv_name, "Serving PV belongs to another cache, keeping it"),
        Ok(None) => {}
        Err(e) => warn!(pv = %pv_name, error = %e, "Failed to get serving PV"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::client::MockCacheKube;
    use crate::scope::tests::{cluster_cache, namespace_cache};
    use k8s_openapi::api::core::v1::{
        HostPathVolumeSource, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
        PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeNodeAffinity,
    };
    use lattice_common::crd::LocalModelNodeGroupSpec;
    use std::sync::{Arc, Mutex};

    pub(crate) fn node_group(name: &str, instance_type: &str) -> LocalModelNodeGroup {
        LocalModelNodeGroup::new(
            name,
            LocalModelNodeGroupSpec {
                persistent_volume_spec: PersistentVolumeSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: Some("standard".to_string()),
                    host_path: Some(HostPathVolumeSource {
                        path: "/models".to_string(),
                        type_: Some("DirectoryOrCreate".to_string()),
                    }),
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
                persistent_volume_claim_spec: PersistentVolumeClaimSpec {
                    access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                    storage_class_name: Some("standard".to_string()),
                    ..Default::default()
                },
            },
        )
    }

    #[test]
    fn cluster_pv_is_owned_and_copies_template() {
        let scope = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        let group = node_group("gpu", "gpu");
        let pv = build_pv(&scope, &group, "iris-gpu-download");

        assert_eq!(pv.metadata.name.as_deref(), Some("iris-gpu-download"));
        assert_eq!(pv.spec, Some(group.spec.persistent_volume_spec.clone()));
        let owners = pv.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "LocalModelCache");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn namespaced_pv_has_no_owner() {
        let scope = CacheScope::from_namespaced(&namespace_cache("iris", "team-a", &["gpu"]));
        let pv = build_pv(&scope, &node_group("gpu", "gpu"), "iris-gpu-team-a-download");
        assert!(pv.metadata.owner_references.is_none());
    }

    #[test]
    fn pvc_binds_to_volume_and_respects_ownership() {
        let scope = CacheScope::from_namespaced(&namespace_cache("iris", "team-a", &["gpu"]));
        let group = node_group("gpu", "gpu");

        let local = build_pvc(&scope, &group, "iris-gpu-download", "team-a", "iris-gpu-team-a-download");
        assert_eq!(
            local.spec.as_ref().and_then(|s| s.volume_name.as_deref()),
            Some("iris-gpu-team-a-download")
        );
        assert!(local.metadata.owner_references.is_some());

        let foreign = build_pvc(&scope, &group, "iris-gpu", "team-b", "iris-gpu-team-b");
        assert!(foreign.metadata.owner_references.is_none());
    }

    #[test]
    fn volumes_carry_cache_label() {
        let scope = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        let pv = build_pv(&scope, &node_group("gpu", "gpu"), "iris-gpu-download");
        assert_eq!(pv.labels().get(CACHE_LABEL).map(String::as_str), Some("iris"));
    }

    #[tokio::test]
    async fn ensure_pv_skips_existing_volume() {
        let mut kube = MockCacheKube::new();
        kube.expect_get_pv()
            .returning(|_| Ok(Some(PersistentVolume::default())));
        kube.expect_create_pv().never();

        let scope = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        ensure_pv(&kube, &build_pv(&scope, &node_group("gpu", "gpu"), "iris-gpu-download")).await;
    }

    #[tokio::test]
    async fn download_volumes_created_in_job_namespace() {
        let created: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let created_clone = created.clone();

        let mut kube = MockCacheKube::new();
        kube.expect_get_pv().returning(|_| Ok(None));
        kube.expect_create_pv().times(1).returning(|_| Ok(()));
        kube.expect_get_pvc().returning(|_, _| Ok(None));
        kube.expect_create_pvc().times(1).returning(move |ns, pvc| {
            created_clone
                .lock()
                .unwrap()
                .push((ns.to_string(), pvc.name_any()));
            Ok(())
        });

        let scope = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        ensure_download_volumes(&kube, &scope, &[node_group("gpu", "gpu")], "model-jobs").await;

        let created = created.lock().unwrap();
        assert_eq!(
            created.as_slice(),
            &[("model-jobs".to_string(), "iris-gpu".to_string())]
        );
    }

    /// A PV as the controllers would have created it for `scope`
    pub(crate) fn pv_for(scope: &CacheScope) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                labels: Some(volume_labels(scope)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// A PVC as the controllers would have created it for `scope`
    pub(crate) fn pvc_for(scope: &CacheScope) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                labels: Some(volume_labels(scope)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn ownership_labels_tell_scopes_apart() {
        let cluster = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        let namespaced =
            CacheScope::from_namespaced(&namespace_cache("iris", "team-a", &["gpu"]));

        assert!(created_for(&cluster, &volume_labels(&cluster)));
        assert!(created_for(&namespaced, &volume_labels(&namespaced)));
        assert!(!created_for(&cluster, &volume_labels(&namespaced)));
        assert!(!created_for(&namespaced, &volume_labels(&cluster)));
        assert!(!created_for(&cluster, &BTreeMap::new()));
    }

    #[tokio::test]
    async fn namespace_cache_keeps_cluster_cache_serving_volumes() {
        let cluster = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        let namespaced =
            CacheScope::from_namespaced(&namespace_cache("iris", "team-a", &["gpu"]));
        assert_eq!(
            cluster.serving_pv_name("gpu", "team-a"),
            namespaced.serving_pv_name("gpu", "team-a")
        );

        let mut kube = MockCacheKube::new();
        let pv = pv_for(&cluster);
        let pvc = pvc_for(&cluster);
        kube.expect_get_pv().returning(move |_| Ok(Some(pv.clone())));
        kube.expect_get_pvc()
            .returning(move |_, _| Ok(Some(pvc.clone())));
        kube.expect_delete_pv().never();
        kube.expect_delete_pvc().never();

        delete_serving_volumes(&kube, &namespaced, "gpu", "team-a", "model-jobs").await;
    }

    #[tokio::test]
    async fn absent_serving_volumes_need_no_delete() {
        let mut kube = MockCacheKube::new();
        kube.expect_get_pv().returning(|_| Ok(None));
        kube.expect_get_pvc().returning(|_, _| Ok(None));
        kube.expect_delete_pv().never();
        kube.expect_delete_pvc().never();

        let scope = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        delete_serving_volumes(&kube, &scope, "gpu", "team-a", "model-jobs").await;
    }

    #[tokio::test]
    async fn serving_delete_preserves_download_claim() {
        let scope = CacheScope::from_cluster(&cluster_cache("iris", &["gpu"]));
        let mut kube = MockCacheKube::new();
        let pv = pv_for(&scope);
        kube.expect_get_pv().returning(move |_| Ok(Some(pv.clone())));
        kube.expect_get_pvc().never();
        kube.expect_delete_pvc().never();
        kube.expect_delete_pv()
            .withf(|name| name == "iris-gpu-model-jobs")
            .times(1)
            .returning(|_| Ok(()));

        delete_serving_volumes(&kube, &scope, "gpu", "model-jobs", "model-jobs").await;
    }
}

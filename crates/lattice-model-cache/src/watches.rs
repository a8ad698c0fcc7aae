//! Watch predicates and mappers for the cache controllers
//!
//! Secondary watches only re-trigger caches on meaningful transitions:
//! - Nodes: created, or not-ready → ready
//! - LocalModelNodes: reported model status changed
//! - Inference workloads: cache labels, node-group annotation or deletion
//!   state changed
//!
//! Transition detection lives in [`TransitionFilter`], so reconcilers never
//! need to reason about what changed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use k8s_openapi::api::core::v1::Node;
use kube::api::DynamicObject;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

use lattice_common::affinity::node_matches_volume;
use lattice_common::crd::{
    LocalModelCache, LocalModelNamespaceCache, LocalModelNode, LocalModelNodeGroup,
    ModelDownloadStatus,
};
use lattice_common::kube_utils::is_node_ready;
use lattice_common::{
    LOCAL_MODEL_LABEL, LOCAL_MODEL_NAMESPACE_LABEL, LOCAL_MODEL_NODE_GROUP_ANNOTATION,
};

// =============================================================================
// Transition filter
// =============================================================================

/// A state change observed on one object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition<S> {
    /// State recorded on the previous event, `None` for the first sighting
    pub previous: Option<S>,
    /// State extracted from the current event
    pub current: S,
}

/// Declarative predicate over per-object state transitions
///
/// Remembers the last extracted state per object and admits an event only
/// when `admit(previous, current)` holds.
pub struct TransitionFilter<K, S> {
    state: fn(&K) -> S,
    admit: fn(Option<&S>, &S) -> bool,
    seen: Mutex<HashMap<String, S>>,
}

impl<K: ResourceExt, S: Clone> TransitionFilter<K, S> {
    /// Build a filter from a state extractor and an admission rule
    pub fn new(state: fn(&K) -> S, admit: fn(Option<&S>, &S) -> bool) -> Self {
        Self {
            state,
            admit,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record the object's state and return the transition if admitted
    pub fn observe(&self, obj: &K) -> Option<Transition<S>> {
        let key = match obj.namespace() {
            Some(ns) => format!("{}/{}", ns, obj.name_any()),
            None => obj.name_any(),
        };
        let current = (self.state)(obj);
        let previous = self
            .seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, current.clone());
        (self.admit)(previous.as_ref(), &current).then_some(Transition { previous, current })
    }

    /// Whether the event should trigger a reconcile
    pub fn admits(&self, obj: &K) -> bool {
        self.observe(obj).is_some()
    }
}

/// Admit new nodes and not-ready → ready transitions
pub fn node_readiness_filter() -> TransitionFilter<Node, bool> {
    TransitionFilter::new(is_node_ready, |previous, ready| match previous {
        None => true,
        Some(was_ready) => !*was_ready && *ready,
    })
}

fn reported_models(lmn: &LocalModelNode) -> BTreeMap<String, ModelDownloadStatus> {
    lmn.status
        .as_ref()
        .map(|s| s.model_status.clone())
        .unwrap_or_default()
}

/// Admit LocalModelNode events whose reported model status changed
///
/// The first sighting is not admitted; the caches it affects were just
/// reconciled when they wrote the node's spec.
pub fn node_status_filter() -> TransitionFilter<LocalModelNode, BTreeMap<String, ModelDownloadStatus>>
{
    TransitionFilter::new(reported_models, |previous, current| {
        previous.is_some_and(|p| p != current)
    })
}

/// Cache-relevant view of an inference workload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadCacheRef {
    /// Workload namespace
    pub namespace: String,
    /// Value of the model label
    pub model: Option<String>,
    /// Value of the model-namespace label
    pub model_namespace: Option<String>,
    /// Node-group override annotation
    pub node_group: Option<String>,
    /// Deletion timestamp is set
    pub deleting: bool,
}

impl WorkloadCacheRef {
    /// Extract the cache reference of a workload
    pub fn from_workload(obj: &DynamicObject) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            model: obj.labels().get(LOCAL_MODEL_LABEL).cloned(),
            model_namespace: obj.labels().get(LOCAL_MODEL_NAMESPACE_LABEL).cloned(),
            node_group: obj
                .annotations()
                .get(LOCAL_MODEL_NODE_GROUP_ANNOTATION)
                .cloned(),
            deleting: obj.metadata.deletion_timestamp.is_some(),
        }
    }

    fn cluster_cache(&self) -> Option<ObjectRef<LocalModelCache>> {
        match (&self.model, &self.model_namespace) {
            (Some(model), None) => Some(ObjectRef::new(model)),
            _ => None,
        }
    }

    fn namespace_cache(&self) -> Option<ObjectRef<LocalModelNamespaceCache>> {
        match (&self.model, &self.model_namespace) {
            (Some(model), Some(ns)) if *ns == self.namespace => {
                Some(ObjectRef::new(model).within(ns))
            }
            _ => None,
        }
    }
}

/// Admit workload events that change which cache they consume, or how
pub fn workload_filter() -> TransitionFilter<DynamicObject, WorkloadCacheRef> {
    TransitionFilter::new(WorkloadCacheRef::from_workload, |previous, current| {
        let references_cache = |r: &WorkloadCacheRef| r.model.is_some();
        match previous {
            None => references_cache(current),
            Some(previous) => {
                previous != current && (references_cache(previous) || references_cache(current))
            }
        }
    })
}

// =============================================================================
// Mappers
// =============================================================================

/// Cache kinds that reference node groups
pub trait UsesNodeGroups {
    /// Node groups listed in the cache spec
    fn node_groups(&self) -> &[String];
}

impl UsesNodeGroups for LocalModelCache {
    fn node_groups(&self) -> &[String] {
        &self.spec.node_groups
    }
}

impl UsesNodeGroups for LocalModelNamespaceCache {
    fn node_groups(&self) -> &[String] {
        &self.spec.node_groups
    }
}

/// Names of the node groups whose PV affinity selects `node`
pub fn groups_for_node(node: &Node, groups: &Store<LocalModelNodeGroup>) -> BTreeSet<String> {
    groups
        .state()
        .iter()
        .filter(|g| node_matches_volume(&g.spec.persistent_volume_spec, node).unwrap_or(false))
        .map(|g| g.name_any())
        .collect()
}

/// Caches that use any of `groups`
pub fn caches_using_groups<K>(caches: &Store<K>, groups: &BTreeSet<String>) -> Vec<ObjectRef<K>>
where
    K: kube::Resource<DynamicType = ()> + UsesNodeGroups + Clone + 'static,
{
    if groups.is_empty() {
        return Vec::new();
    }
    caches
        .state()
        .iter()
        .filter(|c| c.node_groups().iter().any(|g| groups.contains(g)))
        .map(|c| ObjectRef::from_obj(&**c))
        .collect()
}

/// Cluster caches listed in a LocalModelNode's spec
pub fn cluster_caches_for_local_model_node(lmn: &LocalModelNode) -> Vec<ObjectRef<LocalModelCache>> {
    lmn.spec
        .local_models
        .iter()
        .filter(|m| !m.is_namespaced())
        .map(|m| ObjectRef::new(&m.model_name))
        .collect()
}

/// Namespace caches listed in a LocalModelNode's spec
pub fn namespace_caches_for_local_model_node(
    lmn: &LocalModelNode,
) -> Vec<ObjectRef<LocalModelNamespaceCache>> {
    lmn.spec
        .local_models
        .iter()
        .filter(|m| m.is_namespaced())
        .map(|m| ObjectRef::new(&m.model_name).within(&m.namespace))
        .collect()
}

fn both_sides<S, R: PartialEq>(transition: Transition<S>, map: impl Fn(&S) -> Option<R>) -> Vec<R> {
    let mut refs = Vec::new();
    let states = transition.previous.iter().chain(std::iter::once(&transition.current));
    for r in states.filter_map(map) {
        if !refs.contains(&r) {
            refs.push(r);
        }
    }
    refs
}

/// Cluster caches referenced before or after a workload transition
pub fn cluster_caches_for_workload(
    transition: Transition<WorkloadCacheRef>,
) -> Vec<ObjectRef<LocalModelCache>> {
    both_sides(transition, WorkloadCacheRef::cluster_cache)
}

/// Namespace caches referenced before or after a workload transition
pub fn namespace_caches_for_workload(
    transition: Transition<WorkloadCacheRef>,
) -> Vec<ObjectRef<LocalModelNamespaceCache>> {
    both_sides(transition, WorkloadCacheRef::namespace_cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volumes::tests::node_group;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus as CoreNodeStatus};
    use kube::runtime::reflector;
    use kube::runtime::watcher;
    use lattice_common::crd::{LocalModelInfo, LocalModelNodeSpec, LocalModelNodeStatus};
    use lattice_common::kube_utils::inference_service_resource;

    fn node(name: &str, ready: bool) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some(name.to_string());
        node.metadata.labels = Some(BTreeMap::from([(
            "node.kubernetes.io/instance-type".to_string(),
            "gpu".to_string(),
        )]));
        node.status = Some(CoreNodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        node
    }

    fn workload(labels: &[(&str, &str)]) -> DynamicObject {
        let mut obj = DynamicObject::new("llm", &inference_service_resource()).within("team-a");
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        obj
    }

    fn lmn(models: &[(&str, &str)], status: &[(&str, ModelDownloadStatus)]) -> LocalModelNode {
        let mut lmn = LocalModelNode::new(
            "worker",
            LocalModelNodeSpec {
                local_models: models
                    .iter()
                    .map(|(ns, name)| LocalModelInfo {
                        model_name: name.to_string(),
                        namespace: ns.to_string(),
                        source_model_uri: "s3://m".to_string(),
                        ..Default::default()
                    })
                    .collect(),
            },
        );
        lmn.status = Some(LocalModelNodeStatus {
            model_status: status.iter().map(|(k, s)| (k.to_string(), *s)).collect(),
        });
        lmn
    }

    mod filters {
        use super::*;

        #[test]
        fn node_readiness_admits_create_and_recovery_only() {
            let filter = node_readiness_filter();
            assert!(filter.admits(&node("worker", false)));
            assert!(!filter.admits(&node("worker", false)));
            assert!(filter.admits(&node("worker", true)));
            assert!(!filter.admits(&node("worker", true)));
            assert!(!filter.admits(&node("worker", false)));
        }

        #[test]
        fn node_status_admits_changes_after_first_sighting() {
            let filter = node_status_filter();
            let pending = lmn(&[("", "iris")], &[("iris", ModelDownloadStatus::Pending)]);
            let done = lmn(&[("", "iris")], &[("iris", ModelDownloadStatus::Downloaded)]);
            assert!(!filter.admits(&pending));
            assert!(!filter.admits(&pending));
            assert!(filter.admits(&done));
        }

        #[test]
        fn workload_admits_label_changes() {
            let filter = workload_filter();
            assert!(filter.admits(&workload(&[(LOCAL_MODEL_LABEL, "iris")])));
            assert!(!filter.admits(&workload(&[(LOCAL_MODEL_LABEL, "iris")])));

            let transition = filter.observe(&workload(&[])).unwrap();
            assert_eq!(transition.previous.unwrap().model.as_deref(), Some("iris"));
            assert_eq!(transition.current.model, None);
        }

        #[test]
        fn unrelated_workloads_are_ignored() {
            let filter = workload_filter();
            assert!(!filter.admits(&workload(&[("app", "web")])));
            assert!(!filter.admits(&workload(&[("app", "api")])));
        }

        #[test]
        fn workload_deletion_is_admitted() {
            let filter = workload_filter();
            let mut obj = workload(&[(LOCAL_MODEL_LABEL, "iris")]);
            assert!(filter.admits(&obj));
            obj.metadata.deletion_timestamp = Some(
                k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Default::default()),
            );
            assert!(filter.admits(&obj));
        }
    }

    mod mappers {
        use super::*;

        #[test]
        fn label_removal_triggers_previous_cache() {
            let transition = Transition {
                previous: Some(WorkloadCacheRef::from_workload(&workload(&[(
                    LOCAL_MODEL_LABEL,
                    "iris",
                )]))),
                current: WorkloadCacheRef::from_workload(&workload(&[])),
            };
            assert_eq!(
                cluster_caches_for_workload(transition),
                vec![ObjectRef::<LocalModelCache>::new("iris")]
            );
        }

        #[test]
        fn namespace_label_routes_to_namespace_cache() {
            let current = WorkloadCacheRef::from_workload(&workload(&[
                (LOCAL_MODEL_LABEL, "iris"),
                (LOCAL_MODEL_NAMESPACE_LABEL, "team-a"),
            ]));
            let transition = Transition {
                previous: None,
                current,
            };
            assert!(cluster_caches_for_workload(transition.clone()).is_empty());
            assert_eq!(
                namespace_caches_for_workload(transition),
                vec![ObjectRef::<LocalModelNamespaceCache>::new("iris").within("team-a")]
            );
        }

        #[test]
        fn foreign_namespace_label_is_ignored() {
            let current = WorkloadCacheRef::from_workload(&workload(&[
                (LOCAL_MODEL_LABEL, "iris"),
                (LOCAL_MODEL_NAMESPACE_LABEL, "team-b"),
            ]));
            let transition = Transition {
                previous: None,
                current,
            };
            assert!(namespace_caches_for_workload(transition).is_empty());
        }

        #[test]
        fn local_model_node_maps_to_both_kinds() {
            let node = lmn(&[("", "iris"), ("team-a", "iris")], &[]);
            assert_eq!(
                cluster_caches_for_local_model_node(&node),
                vec![ObjectRef::<LocalModelCache>::new("iris")]
            );
            assert_eq!(
                namespace_caches_for_local_model_node(&node),
                vec![ObjectRef::<LocalModelNamespaceCache>::new("iris").within("team-a")]
            );
        }

        #[test]
        fn node_maps_to_caches_using_its_group() {
            let (groups, mut group_writer) = reflector::store::<LocalModelNodeGroup>();
            group_writer.apply_watcher_event(&watcher::Event::Apply(node_group("gpu", "gpu")));
            group_writer.apply_watcher_event(&watcher::Event::Apply(node_group("cpu", "cpu")));

            let (caches, mut cache_writer) = reflector::store::<LocalModelCache>();
            cache_writer.apply_watcher_event(&watcher::Event::Apply(
                crate::scope::tests::cluster_cache("iris", &["gpu"]),
            ));
            cache_writer.apply_watcher_event(&watcher::Event::Apply(
                crate::scope::tests::cluster_cache("bert", &["cpu"]),
            ));

            let matched = groups_for_node(&node("worker", true), &groups);
            assert_eq!(matched, BTreeSet::from(["gpu".to_string()]));
            assert_eq!(
                caches_using_groups(&caches, &matched),
                vec![ObjectRef::<LocalModelCache>::new("iris")]
            );
        }
    }
}

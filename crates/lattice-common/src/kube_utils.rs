//! Kubernetes helpers shared by the cache controllers and the node agent

use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::discovery::ApiResource;
use kube::Resource;

// Kubernetes condition type constants
/// The "Ready" condition type for nodes
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// API version of the inference workloads that consume cached models
pub const INFERENCE_SERVICE_API_VERSION: &str = "serving.kserve.io/v1beta1";

/// Kind of the inference workloads that consume cached models
pub const INFERENCE_SERVICE_KIND: &str = "InferenceService";

/// Build an `ApiResource` from apiVersion and kind without discovery
///
/// # Example
/// ```ignore
/// let ar = build_api_resource("serving.kserve.io/v1beta1", "InferenceService");
/// let api: Api<DynamicObject> = Api::all_with(client, &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// `ApiResource` for inference workloads
pub fn inference_service_resource() -> ApiResource {
    build_api_resource(INFERENCE_SERVICE_API_VERSION, INFERENCE_SERVICE_KIND)
}

/// Split an apiVersion into (group, version)
///
/// ```ignore
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Pluralize a Kubernetes resource kind using the simple English rules the
/// API server applies to CRDs
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Check whether a node's `Ready` condition is `True`
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
        .unwrap_or(false)
}

/// Controller owner reference pointing at `owner`
///
/// Returns `None` when the owner has not been persisted yet (no uid).
pub fn controller_owner_ref<K>(owner: &K) -> Option<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner.controller_owner_ref(&())
}

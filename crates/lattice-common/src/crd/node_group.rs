//! LocalModelNodeGroup CRD types
//!
//! A node group pairs a PersistentVolume template (whose node affinity picks
//! the member nodes) with a PersistentVolumeClaim template. Caches copy both
//! templates for their download and serving volumes.

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PersistentVolumeSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A set of nodes sharing the same local storage layout
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "LocalModelNodeGroup",
    plural = "localmodelnodegroups",
    shortname = "lmng",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelNodeGroupSpec {
    /// PV template; its `nodeAffinity.required` selects the member nodes
    pub persistent_volume_spec: PersistentVolumeSpec,

    /// PVC template bound to volumes created from `persistentVolumeSpec`
    pub persistent_volume_claim_spec: PersistentVolumeClaimSpec,
}

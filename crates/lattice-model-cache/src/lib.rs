//! Local model cache controllers for Lattice
//!
//! Keeps a model's weights on the local disk of every node in its node
//! groups and exposes them to inference workloads through PV/PVC pairs:
//! - `LocalModelCache` (cluster-scoped) and `LocalModelNamespaceCache` share
//!   one reconciliation engine parameterized by [`CacheScope`]
//! - the model is fanned out into each matching node's `LocalModelNode`,
//!   which the node agent downloads and reports on
//! - `LocalModelNodeGroup` objects get a node agent DaemonSet
//!
//! Secondary watches are filtered by the predicates in [`watches`].

#![deny(missing_docs)]

pub mod client;
mod controller;
mod engine;
pub mod node_group;
mod scope;
mod volumes;
pub mod watches;

pub use client::{CacheKube, CacheKubeImpl, ConsumerWorkload};
pub use controller::{
    error_policy, reconcile_cluster_cache, reconcile_namespace_cache, ERROR_REQUEUE,
};
pub use engine::{aggregate_copies, reconcile_cache, upsert_model, CacheContext, CACHE_RESYNC_INTERVAL};
pub use scope::{
    CacheKind, CacheScope, VolumeTarget, CLUSTER_CACHE_FINALIZER, NAMESPACE_CACHE_FINALIZER,
};
pub use volumes::CACHE_LABEL;

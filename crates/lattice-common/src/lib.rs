//! Common types for the Lattice local model cache: CRDs, errors,
//! configuration, node-affinity matching and utilities

#![deny(missing_docs)]

pub mod affinity;
pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod telemetry;

pub use config::LocalModelConfig;
pub use error::ReconcileError;

/// Namespace for Lattice system resources (operator, node agents, config)
pub const LATTICE_SYSTEM_NAMESPACE: &str = "lattice-system";

/// Workload label naming the cache a workload consumes
pub const LOCAL_MODEL_LABEL: &str = "lattice.dev/local-model";

/// Workload label naming the namespace of a namespace-scoped cache
pub const LOCAL_MODEL_NAMESPACE_LABEL: &str = "lattice.dev/local-model-namespace";

/// Workload annotation overriding the node group a workload is served from
pub const LOCAL_MODEL_NODE_GROUP_ANNOTATION: &str = "lattice.dev/local-model-node-group";

/// Mount path of the node group volume inside agents and download jobs
pub const MODEL_MOUNT_PATH: &str = "/mnt/models";

/// Sub-directory of the node group volume that holds model folders
pub const MODELS_SUBDIR: &str = "models";

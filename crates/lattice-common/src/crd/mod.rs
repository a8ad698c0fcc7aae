//! Custom Resource Definitions for the Lattice local model cache
//!
//! All kinds live in the `lattice.dev/v1alpha1` group.

mod local_model_cache;
mod local_model_node;
mod node_group;
mod storage_container;

pub use local_model_cache::{
    LocalModelCache, LocalModelCacheSpec, LocalModelCacheStatus, LocalModelNamespaceCache,
    LocalModelNamespaceCacheSpec, LocalModelStorageSpec, ModelCopies, NamespacedName, NodeStatus,
};
pub use local_model_node::{
    download_pvc_name, model_folder_name, model_status_key, LocalModelInfo, LocalModelNode,
    LocalModelNodeSpec, LocalModelNodeStatus, ModelDownloadStatus,
};
pub use node_group::{LocalModelNodeGroup, LocalModelNodeGroupSpec};
pub use storage_container::{
    ClusterStorageContainer, ClusterStorageContainerSpec, StorageContainerWorkload,
    SupportedUriFormat,
};

/// API group shared by every kind in this module
pub const API_GROUP: &str = "lattice.dev";

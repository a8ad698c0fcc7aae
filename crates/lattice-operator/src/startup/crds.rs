//! CRD installation utilities
//!
//! Installs the local model CRDs on startup using server-side apply, and
//! renders them as YAML for `--crd`.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use lattice_common::crd::{
    ClusterStorageContainer, LocalModelCache, LocalModelNamespaceCache, LocalModelNode,
    LocalModelNodeGroup,
};

/// Field manager used for CRD installation
const FIELD_MANAGER: &str = "lattice-model-cache";

/// Every CRD served by the operator
pub fn local_model_crds() -> Vec<CustomResourceDefinition> {
    vec![
        LocalModelCache::crd(),
        LocalModelNamespaceCache::crd(),
        LocalModelNode::crd(),
        LocalModelNodeGroup::crd(),
        ClusterStorageContainer::crd(),
    ]
}

/// All CRDs as a multi-document YAML stream
pub fn crds_yaml() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for crd in local_model_crds() {
        docs.push(
            serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?,
        );
    }
    Ok(docs.join("---\n"))
}

/// Ensure all local model CRDs are installed and current
pub async fn ensure_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing local model CRDs...");
    for crd in local_model_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!("Installing {} CRD...", name);
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    }
    tracing::info!("Local model CRDs installed/updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_kinds_share_the_lattice_group() {
        let crds = local_model_crds();
        assert_eq!(crds.len(), 5);
        for crd in &crds {
            assert_eq!(crd.spec.group, lattice_common::crd::API_GROUP);
        }
    }

    #[test]
    fn scopes_match_the_kinds() {
        let scope = |kind: &str| {
            local_model_crds()
                .into_iter()
                .find(|c| c.spec.names.kind == kind)
                .map(|c| c.spec.scope)
                .unwrap()
        };
        assert_eq!(scope("LocalModelCache"), "Cluster");
        assert_eq!(scope("LocalModelNamespaceCache"), "Namespaced");
        assert_eq!(scope("LocalModelNode"), "Cluster");
        assert_eq!(scope("LocalModelNodeGroup"), "Cluster");
        assert_eq!(scope("ClusterStorageContainer"), "Cluster");
    }

    #[test]
    fn yaml_has_one_document_per_crd() {
        let yaml = crds_yaml().unwrap();
        assert_eq!(yaml.matches("kind: CustomResourceDefinition").count(), 5);
        assert_eq!(yaml.matches("---\n").count(), 4);
    }
}

//! ClusterStorageContainer CRD types
//!
//! A registry of downloader containers. The node agent picks the first enabled
//! entry whose workload type is `localModelDownloadJob` and whose URI formats
//! match the model's source URI.

use k8s_openapi::api::core::v1::Container;
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// Where a storage container may be used
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StorageContainerWorkload {
    /// Injected as a storage-initializer init container
    #[default]
    InitContainer,
    /// Used by the node agent's download jobs
    LocalModelDownloadJob,
}

/// A URI pattern a storage container can handle
///
/// A non-empty `prefix` is matched literally; otherwise `regex` is used.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SupportedUriFormat {
    /// Literal URI prefix (e.g. `s3://`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    /// Regular expression the URI must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl SupportedUriFormat {
    /// Check whether `uri` matches this format
    pub fn matches(&self, uri: &str) -> Result<bool, ReconcileError> {
        if let Some(prefix) = self.prefix.as_deref().filter(|p| !p.is_empty()) {
            return Ok(uri.starts_with(prefix));
        }
        match self.regex.as_deref().filter(|r| !r.is_empty()) {
            Some(pattern) => {
                let re = Regex::new(pattern).map_err(|e| {
                    ReconcileError::Config(format!(
                        "invalid storage container uri regex '{}': {}",
                        pattern, e
                    ))
                })?;
                Ok(re.is_match(uri))
            }
            None => Ok(false),
        }
    }
}

/// A downloader container and the URIs it supports
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "lattice.dev",
    version = "v1alpha1",
    kind = "ClusterStorageContainer",
    plural = "clusterstoragecontainers",
    shortname = "csc",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.container.image"}"#,
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workloadType"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStorageContainerSpec {
    /// Container template for the downloader
    pub container: Container,

    /// URI formats this container can download
    #[serde(default)]
    pub supported_uri_formats: Vec<SupportedUriFormat>,

    /// Where the container may be used
    #[serde(default)]
    pub workload_type: StorageContainerWorkload,

    /// Disabled containers are skipped during resolution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

impl ClusterStorageContainerSpec {
    /// True when the container is enabled, usable for download jobs, and
    /// supports `uri`
    pub fn serves_download_of(&self, uri: &str) -> Result<bool, ReconcileError> {
        if self.disabled.unwrap_or(false)
            || self.workload_type != StorageContainerWorkload::LocalModelDownloadJob
        {
            return Ok(false);
        }
        for format in &self.supported_uri_formats {
            if format.matches(uri)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

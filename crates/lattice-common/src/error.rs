//! Error types for the local model cache controllers
//!
//! Every reconciler returns [`ReconcileError`]. Variants carry a formatted
//! message rather than the source error so they stay `Clone` and cheap to log
//! from `error_policy`.

use thiserror::Error;

/// Error returned by reconcilers and the Kubernetes access traits
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// Kubernetes API call failed
    #[error("kubernetes error: {0}")]
    Kube(String),

    /// A resource spec is invalid
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced configuration object is missing or malformed
    /// (node group, storage container, config map)
    #[error("configuration error: {0}")]
    Config(String),

    /// Local filesystem operation failed (agent only)
    #[error("filesystem error: {0}")]
    Filesystem(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    /// Wrap a kube error with a short description of the failed operation
    pub fn kube(context: impl std::fmt::Display, err: kube::Error) -> Self {
        Self::Kube(format!("{}: {}", context, err))
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Kube(_) => "kube",
            Self::Validation(_) => "validation",
            Self::Config(_) => "config",
            Self::Filesystem(_) => "filesystem",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<kube::Error> for ReconcileError {
    fn from(err: kube::Error) -> Self {
        Self::Kube(err.to_string())
    }
}

/// True when the API server answered 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// True when the API server answered 409 (already exists, or a stale
/// resourceVersion on an optimistic update)
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn not_found_detection() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
        assert!(!is_not_found(&api_error(500)));
    }

    #[test]
    fn conflict_detection() {
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(404)));
    }

    #[test]
    fn kube_wrapper_includes_context() {
        let err = ReconcileError::kube("failed to get node", api_error(500));
        let msg = err.to_string();
        assert!(msg.starts_with("kubernetes error: failed to get node"));
        assert_eq!(err.kind(), "kube");
    }

    #[test]
    fn display_formats() {
        assert_eq!(
            ReconcileError::Config("node group gpu not found".into()).to_string(),
            "configuration error: node group gpu not found"
        );
    }
}

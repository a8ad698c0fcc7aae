//! LocalModelCache and LocalModelNamespaceCache controllers
//!
//! Both kinds are thin adapters: they validate the object, build a
//! [`CacheScope`] and hand it to [`reconcile_cache`]. Validation is skipped
//! for objects being deleted so a broken spec can never block cleanup.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{instrument, warn};

use lattice_common::crd::{LocalModelCache, LocalModelNamespaceCache};
use lattice_common::metrics::ReconcileTimer;
use lattice_common::ReconcileError;

use crate::engine::{reconcile_cache, CacheContext};
use crate::scope::CacheScope;

/// Requeue delay after a failed reconcile
pub const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Error policy shared by both cache controllers.
///
/// Logs the error and requeues for retry after 30 seconds.
pub fn error_policy<K: ResourceExt>(
    obj: Arc<K>,
    error: &ReconcileError,
    _ctx: Arc<CacheContext>,
) -> Action {
    warn!(
        cache = %obj.name_any(),
        namespace = obj.namespace().as_deref().unwrap_or(""),
        error = %error,
        "Local model cache reconcile error, will retry"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Reconcile a cluster-scoped LocalModelCache
#[instrument(skip(cache, ctx), fields(cache = %cache.name_any()))]
pub async fn reconcile_cluster_cache(
    cache: Arc<LocalModelCache>,
    ctx: Arc<CacheContext>,
) -> Result<Action, ReconcileError> {
    let timer = ReconcileTimer::start("LocalModelCache");
    let result = async {
        if cache.metadata.deletion_timestamp.is_none() {
            cache.spec.validate()?;
        }
        reconcile_cache(&CacheScope::from_cluster(&cache), &ctx).await
    }
    .await;
    timer.finish(&result);
    result
}

/// Reconcile a LocalModelNamespaceCache
#[instrument(
    skip(cache, ctx),
    fields(cache = %cache.name_any(), namespace = cache.namespace().as_deref().unwrap_or(""))
)]
pub async fn reconcile_namespace_cache(
    cache: Arc<LocalModelNamespaceCache>,
    ctx: Arc<CacheContext>,
) -> Result<Action, ReconcileError> {
    let timer = ReconcileTimer::start("LocalModelNamespaceCache");
    let result = async {
        if cache.namespace().is_none() {
            return Err(ReconcileError::Validation(
                "LocalModelNamespaceCache must be namespaced".into(),
            ));
        }
        if cache.metadata.deletion_timestamp.is_none() {
            cache.spec.validate()?;
        }
        reconcile_cache(&CacheScope::from_namespaced(&cache), &ctx).await
    }
    .await;
    timer.finish(&result);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockCacheKube;
    use crate::scope::tests::{cluster_cache, namespace_cache};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use lattice_common::LocalModelConfig;

    fn ctx(kube: MockCacheKube) -> Arc<CacheContext> {
        Arc::new(CacheContext::with_kube(
            Arc::new(kube),
            LocalModelConfig::default(),
        ))
    }

    #[tokio::test]
    async fn invalid_cluster_cache_is_rejected_before_any_call() {
        let mut cache = cluster_cache("iris", &["gpu"]);
        cache.spec.source_model_uri = "not-a-uri".to_string();

        let mut kube = MockCacheKube::new();
        kube.expect_add_finalizer().never();

        let err = reconcile_cluster_cache(Arc::new(cache), ctx(kube))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[tokio::test]
    async fn invalid_spec_does_not_block_deletion() {
        let mut cache = cluster_cache("iris", &["gpu"]);
        cache.spec.source_model_uri = String::new();
        cache.metadata.deletion_timestamp = Some(Time(Default::default()));

        // No finalizer: deletion is already complete
        let kube = MockCacheKube::new();
        let action = reconcile_cluster_cache(Arc::new(cache), ctx(kube))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn namespace_cache_without_namespace_is_rejected() {
        let mut cache = namespace_cache("iris", "team-a", &["gpu"]);
        cache.metadata.namespace = None;

        let err = reconcile_namespace_cache(Arc::new(cache), ctx(MockCacheKube::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Validation(_)));
    }

    #[tokio::test]
    async fn namespace_cache_finalizer_uses_its_own_name() {
        let mut kube = MockCacheKube::new();
        kube.expect_add_finalizer()
            .withf(|scope| scope.finalizer() == crate::scope::NAMESPACE_CACHE_FINALIZER)
            .times(1)
            .returning(|_| Err(ReconcileError::Kube("conflict".into())));

        let cache = namespace_cache("iris", "team-a", &["gpu"]);
        let err = reconcile_namespace_cache(Arc::new(cache), ctx(kube))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Kube(_)));
    }

    #[test]
    fn error_policy_requeues() {
        let cache = Arc::new(cluster_cache("iris", &["gpu"]));
        let action = error_policy(
            cache,
            &ReconcileError::Kube("boom".into()),
            ctx(MockCacheKube::new()),
        );
        assert_eq!(action, Action::requeue(ERROR_REQUEUE));
    }
}

//! Metrics for local model cache observability
//!
//! Provides OpenTelemetry metrics for:
//! - Cache reconciliation (duration, errors)
//! - Model copies per cache
//! - Node agent activity (download jobs, pruned jobs, removed folders)

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Global meter for local model cache metrics
static METER: Lazy<Meter> = Lazy::new(|| global::meter("lattice-model-cache"));

// ============================================================================
// Cache Reconciliation Metrics
// ============================================================================

/// Histogram of reconciliation duration
///
/// Labels:
/// - `kind`: LocalModelCache, LocalModelNamespaceCache, LocalModelNode, LocalModelNodeGroup
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("lattice_local_model_reconcile_duration_seconds")
        .with_description("Duration of local model reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of reconciliation errors
///
/// Labels:
/// - `kind`: reconciled kind
/// - `error_type`: kube, validation, config, filesystem, internal
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_local_model_reconcile_errors_total")
        .with_description("Total number of local model reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Gauge of model copies per cache
///
/// Labels:
/// - `cache`: `name` or `namespace/name`
/// - `state`: total, available, failed
pub static MODEL_COPIES: Lazy<Gauge<i64>> = Lazy::new(|| {
    METER
        .i64_gauge("lattice_local_model_copies")
        .with_description("Number of node copies of a cached model by state")
        .with_unit("{copies}")
        .build()
});

// ============================================================================
// Node Agent Metrics
// ============================================================================

/// Counter of download jobs created
///
/// Labels:
/// - `node`: node name
pub static DOWNLOAD_JOBS_CREATED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_local_model_download_jobs_created_total")
        .with_description("Total number of model download jobs created")
        .with_unit("{jobs}")
        .build()
});

/// Counter of download jobs deleted because their model left the node
///
/// Labels:
/// - `node`: node name
pub static DOWNLOAD_JOBS_PRUNED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_local_model_download_jobs_pruned_total")
        .with_description("Total number of stale model download jobs deleted")
        .with_unit("{jobs}")
        .build()
});

/// Counter of model folders removed from node storage
///
/// Labels:
/// - `node`: node name
pub static MODEL_FOLDERS_REMOVED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("lattice_local_model_folders_removed_total")
        .with_description("Total number of model folders removed from node storage")
        .with_unit("{folders}")
        .build()
});

// ============================================================================
// Metric Recording Helpers
// ============================================================================

/// Record a reconciliation with timing
pub struct ReconcileTimer {
    kind: &'static str,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(kind: &'static str) -> Self {
        Self {
            kind,
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("kind", self.kind),
                KeyValue::new("error_type", error_type),
            ],
        );
    }

    /// Record the outcome of a reconcile result
    pub fn finish<T>(self, result: &Result<T, crate::ReconcileError>) {
        match result {
            Ok(_) => self.success(),
            Err(e) => self.error(e.kind()),
        }
    }
}

/// Publish aggregated copy counts for a cache
pub fn set_model_copies(cache: &str, total: i32, available: i32, failed: i32) {
    for (state, value) in [("total", total), ("available", available), ("failed", failed)] {
        MODEL_COPIES.record(
            i64::from(value),
            &[
                KeyValue::new("cache", cache.to_string()),
                KeyValue::new("state", state),
            ],
        );
    }
}

/// Count a created download job
pub fn record_download_job_created(node: &str) {
    DOWNLOAD_JOBS_CREATED.add(1, &[KeyValue::new("node", node.to_string())]);
}

/// Count a pruned download job
pub fn record_download_job_pruned(node: &str) {
    DOWNLOAD_JOBS_PRUNED.add(1, &[KeyValue::new("node", node.to_string())]);
}

/// Count a removed model folder
pub fn record_model_folder_removed(node: &str) {
    MODEL_FOLDERS_REMOVED.add(1, &[KeyValue::new("node", node.to_string())]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReconcileError;

    #[test]
    fn reconcile_timer_records_success() {
        let timer = ReconcileTimer::start("LocalModelCache");
        assert_eq!(timer.kind, "LocalModelCache");
        timer.success();
    }

    #[test]
    fn reconcile_timer_records_error_result() {
        let result: Result<(), ReconcileError> = Err(ReconcileError::Config("missing".into()));
        ReconcileTimer::start("LocalModelNode").finish(&result);
    }

    #[test]
    fn helpers_do_not_panic_without_provider() {
        set_model_copies("iris", 3, 2, 1);
        record_download_job_created("worker-1");
        record_download_job_pruned("worker-1");
        record_model_folder_removed("worker-1");
    }
}

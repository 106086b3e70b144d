//! Controller operation metrics
//!
//! Kept on a private registry so several controllers (and tests) can live in
//! one process without colliding in the global default registry.

use crate::error::{Error, Result};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

// =============================================================================
// Outcome Labels
// =============================================================================

pub const OUTCOME_SUCCESS: &str = "success";
/// Retryable: lock contention or a clone still materializing
pub const OUTCOME_ABORTED: &str = "aborted";
pub const OUTCOME_ERROR: &str = "error";

/// Outcome label for a finished operation
pub fn outcome_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => OUTCOME_SUCCESS,
        Err(e) if e.is_retryable() => OUTCOME_ABORTED,
        Err(_) => OUTCOME_ERROR,
    }
}

// =============================================================================
// Controller Metrics
// =============================================================================

/// Counters and latency histograms per controller operation
#[derive(Clone)]
pub struct ControllerMetrics {
    registry: Registry,
    operations: IntCounterVec,
    duration: HistogramVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations = IntCounterVec::new(
            Opts::new(
                "cephfs_controller_operations_total",
                "Controller operations by outcome",
            ),
            &["operation", "outcome"],
        )
        .map_err(metrics_error)?;

        let duration = HistogramVec::new(
            HistogramOpts::new(
                "cephfs_controller_operation_duration_seconds",
                "Duration of controller operations",
            ),
            &["operation"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(operations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(duration.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            operations,
            duration,
        })
    }

    /// Record one finished operation
    pub fn observe<T>(&self, operation: &str, result: &Result<T>, elapsed: Duration) {
        self.operations
            .with_label_values(&[operation, outcome_label(result)])
            .inc();
        self.duration
            .with_label_values(&[operation])
            .observe(elapsed.as_secs_f64());
    }

    /// Number of operations recorded with the given outcome
    pub fn count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .with_label_values(&[operation, outcome])
            .get()
    }

    /// Text exposition of every metric in the registry
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

impl std::fmt::Debug for ControllerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerMetrics").finish_non_exhaustive()
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&Ok::<_, Error>(())), OUTCOME_SUCCESS);
        assert_eq!(
            outcome_label::<()>(&Err(Error::OperationPending { key: "pvc".into() })),
            OUTCOME_ABORTED
        );
        assert_eq!(
            outcome_label::<()>(&Err(Error::Internal("boom".into()))),
            OUTCOME_ERROR
        );
    }

    #[test]
    fn test_observe_and_render() {
        let metrics = ControllerMetrics::new().unwrap();
        metrics.observe("create_volume", &Ok::<_, Error>(()), Duration::from_millis(5));
        metrics.observe::<()>(
            "create_volume",
            &Err(Error::CloneInProgress { volume_id: "v".into() }),
            Duration::from_millis(1),
        );

        assert_eq!(metrics.count("create_volume", OUTCOME_SUCCESS), 1);
        assert_eq!(metrics.count("create_volume", OUTCOME_ABORTED), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("cephfs_controller_operations_total"));
        assert!(text.contains("cephfs_controller_operation_duration_seconds"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = ControllerMetrics::new().unwrap();
        let b = ControllerMetrics::new().unwrap();
        a.observe("delete_volume", &Ok::<_, Error>(()), Duration::ZERO);
        assert_eq!(b.count("delete_volume", OUTCOME_SUCCESS), 0);
    }
}

//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Scheduler (submissions, outcomes, terminal failures)
//! - Acquisition (restores, file downloads)
//! - Store (contention retries) and daemon cycles

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Scheduler Metrics
// =============================================================================

/// Jobs handed to the batch queue.
pub static JOBS_SUBMITTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("pulsarflow_jobs_submitted_total", "Total jobs submitted").unwrap()
});

/// Finished submissions by result.
pub static JOB_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pulsarflow_job_outcomes_total", "Total finished job submissions"),
        &["result"], // "processed", "processing_failed", "submission_failed"
    )
    .unwrap()
});

/// Jobs given up on, by reason.
pub static TERMINAL_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "pulsarflow_terminal_failures_total",
            "Total jobs marked terminal_failure",
        ),
        &["reason"], // "attempts_exhausted", "precheck"
    )
    .unwrap()
});

// =============================================================================
// Acquisition Metrics
// =============================================================================

/// Restores requested from the archive.
pub static RESTORES_REQUESTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "pulsarflow_restores_requested_total",
        "Total restores requested",
    )
    .unwrap()
});

/// File download attempts by result.
pub static DOWNLOADS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("pulsarflow_downloads_total", "Total file download attempts"),
        &["result"], // "downloaded", "failed"
    )
    .unwrap()
});

// =============================================================================
// Infrastructure Metrics
// =============================================================================

/// Transactions retried because the database was busy.
pub static STORE_BUSY_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "pulsarflow_store_busy_retries_total",
        "Total store transactions retried on contention",
    )
    .unwrap()
});

/// Daemon cycle duration in seconds.
pub static CYCLE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("pulsarflow_cycle_duration_seconds", "Duration of daemon cycles")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["daemon", "result"], // result: "ok", "error"
    )
    .unwrap()
});

// =============================================================================
// Helper functions
// =============================================================================

/// Get all core metrics for registration in a registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Scheduler
        Box::new(JOBS_SUBMITTED.clone()),
        Box::new(JOB_OUTCOMES.clone()),
        Box::new(TERMINAL_FAILURES.clone()),
        // Acquisition
        Box::new(RESTORES_REQUESTED.clone()),
        Box::new(DOWNLOADS.clone()),
        // Infrastructure
        Box::new(STORE_BUSY_RETRIES.clone()),
        Box::new(CYCLE_DURATION.clone()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_register() {
        let registry = prometheus::Registry::new();
        for metric in all_metrics() {
            registry.register(metric).unwrap();
        }
        JOB_OUTCOMES.with_label_values(&["processed"]).inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "pulsarflow_job_outcomes_total"));
    }
}

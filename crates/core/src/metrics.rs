//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Installs (started, completed, failed, cancelled)
//! - Stages (duration, transient retries, patch warnings)
//! - Cleanup (paths removed, errors)

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Install Metrics
// =============================================================================

/// Installs that left the queue and started running.
pub static INSTALLS_STARTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("decklift_installs_started_total", "Total installs started").unwrap()
});

/// Installs that completed successfully.
pub static INSTALLS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "decklift_installs_completed_total",
        "Total installs completed successfully",
    )
    .unwrap()
});

/// Failed installs by the stage that failed.
pub static INSTALLS_FAILED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("decklift_installs_failed_total", "Total failed installs"),
        &["stage"], // "download", "patch", "transfer", "register", "validate"
    )
    .unwrap()
});

/// Installs cancelled while queued or running.
pub static INSTALLS_CANCELLED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("decklift_installs_cancelled_total", "Total cancelled installs").unwrap()
});

// =============================================================================
// Stage Metrics
// =============================================================================

/// Stage duration in seconds.
pub static STAGE_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new("decklift_stage_duration_seconds", "Duration of pipeline stages")
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
        &["stage", "result"], // result: "success", "failed", "cancelled"
    )
    .unwrap()
});

/// Transient failures retried, by stage.
pub static STAGE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("decklift_stage_retries_total", "Total transient stage retries"),
        &["stage"],
    )
    .unwrap()
});

/// Patch attempts that failed and became warnings.
pub static PATCH_WARNINGS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "decklift_patch_warnings_total",
        "Total patch failures downgraded to warnings",
    )
    .unwrap()
});

// =============================================================================
// Cleanup Metrics
// =============================================================================

/// Paths removed by cleanup.
pub static CLEANUP_PATHS_REMOVED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "decklift_cleanup_paths_removed_total",
        "Total paths removed by cleanup",
    )
    .unwrap()
});

/// Paths cleanup failed to remove.
pub static CLEANUP_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("decklift_cleanup_errors_total", "Total cleanup failures").unwrap()
});

/// Returns all core metrics for registration with a Prometheus registry.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        // Installs
        Box::new(INSTALLS_STARTED.clone()),
        Box::new(INSTALLS_COMPLETED.clone()),
        Box::new(INSTALLS_FAILED.clone()),
        Box::new(INSTALLS_CANCELLED.clone()),
        // Stages
        Box::new(STAGE_DURATION.clone()),
        Box::new(STAGE_RETRIES.clone()),
        Box::new(PATCH_WARNINGS.clone()),
        // Cleanup
        Box::new(CLEANUP_PATHS_REMOVED.clone()),
        Box::new(CLEANUP_ERRORS.clone()),
    ]
}

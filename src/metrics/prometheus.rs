//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by stage-forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all stage-forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Task status transitions, labeled by source and target status.
pub static TRANSITIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage faults that moved a task to `error`, labeled by stage and kind.
pub static STAGE_FAULTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage operation duration in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Feedback entries recorded, labeled by reviewing and reviewed stage.
pub static FEEDBACK_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage retries, labeled by retried stage and outcome.
pub static RETRIES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Peer-review runs, labeled by outcome.
pub static PIPELINE_RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Peer-review run duration in seconds.
pub static PIPELINE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Quality scores extracted from successful runs.
pub static QUALITY_SCORE: OnceLock<Histogram> = OnceLock::new();

/// Number of task ids currently queued.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Lifecycle metrics
    let transitions_total = CounterVec::new(
        Opts::new("stage_forge_transitions_total", "Task status transitions"),
        &["from", "to"],
    )?;

    let stage_faults_total = CounterVec::new(
        Opts::new(
            "stage_forge_stage_faults_total",
            "Stage faults that moved a task to error",
        ),
        &["stage", "kind"],
    )?;

    let stage_duration = HistogramVec::new(
        HistogramOpts::new(
            "stage_forge_stage_duration_seconds",
            "Stage operation duration in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["stage"],
    )?;

    // Peer-review metrics
    let feedback_total = CounterVec::new(
        Opts::new("stage_forge_feedback_total", "Feedback entries recorded"),
        &["from_stage", "to_stage"],
    )?;

    let retries_total = CounterVec::new(
        Opts::new("stage_forge_retries_total", "Stage retries after rejection"),
        &["stage", "outcome"],
    )?;

    let pipeline_runs_total = CounterVec::new(
        Opts::new("stage_forge_pipeline_runs_total", "Peer-review runs"),
        &["outcome"],
    )?;

    let pipeline_duration = Histogram::with_opts(
        HistogramOpts::new(
            "stage_forge_pipeline_duration_seconds",
            "Peer-review run duration in seconds",
        )
        .buckets(vec![5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
    )?;

    let quality_score = Histogram::with_opts(
        HistogramOpts::new(
            "stage_forge_quality_score",
            "Quality scores of successful runs",
        )
        .buckets(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0]),
    )?;

    // Queue metrics
    let queue_depth = Gauge::new("stage_forge_queue_depth", "Number of queued tasks")?;

    registry.register(Box::new(transitions_total.clone()))?;
    registry.register(Box::new(stage_faults_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(feedback_total.clone()))?;
    registry.register(Box::new(retries_total.clone()))?;
    registry.register(Box::new(pipeline_runs_total.clone()))?;
    registry.register(Box::new(pipeline_duration.clone()))?;
    registry.register(Box::new(quality_score.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;

    // A failed set means another caller initialized first.
    let _ = REGISTRY.set(registry);
    let _ = TRANSITIONS_TOTAL.set(transitions_total);
    let _ = STAGE_FAULTS_TOTAL.set(stage_faults_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = FEEDBACK_TOTAL.set(feedback_total);
    let _ = RETRIES_TOTAL.set(retries_total);
    let _ = PIPELINE_RUNS_TOTAL.set(pipeline_runs_total);
    let _ = PIPELINE_DURATION.set(pipeline_duration);
    let _ = QUALITY_SCORE.set(quality_score);
    let _ = QUEUE_DEPTH.set(queue_depth);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

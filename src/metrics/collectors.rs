//! High-level recording interface over the Prometheus statics.
//!
//! Every method is a no-op until [`super::init_metrics`] has run, so
//! library code and tests can record freely.

use super::prometheus::{
    FEEDBACK_TOTAL, PIPELINE_DURATION, PIPELINE_RUNS_TOTAL, QUALITY_SCORE, QUEUE_DEPTH,
    RETRIES_TOTAL, STAGE_DURATION, STAGE_FAULTS_TOTAL, TRANSITIONS_TOTAL,
};

/// Records engine and peer-review metrics.
///
/// # Example
///
/// ```ignore
/// use stage_forge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_transition("ready_for_testing", "testing");
/// collector.record_retry("implement", true);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn record_transition(&self, from: &str, to: &str) {
        if let Some(transitions) = TRANSITIONS_TOTAL.get() {
            transitions.with_label_values(&[from, to]).inc();
        }
    }

    /// Record a stage fault.
    ///
    /// `kind` is one of "agent", "timeout", "panic" or "engine".
    pub fn record_fault(&self, stage: &str, kind: &str) {
        if let Some(faults) = STAGE_FAULTS_TOTAL.get() {
            faults.with_label_values(&[stage, kind]).inc();
        }

        tracing::trace!(stage = stage, kind = kind, "Recorded stage fault metric");
    }

    pub fn record_stage_duration(&self, stage: &str, duration_secs: f64) {
        if let Some(durations) = STAGE_DURATION.get() {
            durations.with_label_values(&[stage]).observe(duration_secs);
        }
    }

    pub fn record_feedback(&self, from_stage: &str, to_stage: &str) {
        if let Some(feedback) = FEEDBACK_TOTAL.get() {
            feedback.with_label_values(&[from_stage, to_stage]).inc();
        }
    }

    pub fn record_retry(&self, stage: &str, success: bool) {
        let outcome = if success { "accepted" } else { "rejected" };
        if let Some(retries) = RETRIES_TOTAL.get() {
            retries.with_label_values(&[stage, outcome]).inc();
        }

        tracing::trace!(stage = stage, outcome = outcome, "Recorded retry metric");
    }

    /// Record a finished peer-review run.
    ///
    /// `outcome` is "success" or the failure kind of the run.
    pub fn record_pipeline_run(&self, outcome: &str, duration_secs: f64) {
        if let Some(runs) = PIPELINE_RUNS_TOTAL.get() {
            runs.with_label_values(&[outcome]).inc();
        }

        if let Some(duration) = PIPELINE_DURATION.get() {
            duration.observe(duration_secs);
        }
    }

    pub fn record_quality_score(&self, score: f64) {
        if let Some(quality) = QUALITY_SCORE.get() {
            quality.observe(score);
        }
    }

    pub fn set_queue_depth(&self, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(depth as f64);
        }
    }
}

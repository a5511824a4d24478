//! Prometheus-based monitoring.
//!
//! Covers status transitions, stage faults and durations, peer-review
//! feedback and retries, run outcomes and queue depth.
//!
//! # Example
//!
//! ```ignore
//! use stage_forge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_pipeline_run("success", 42.0);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    FEEDBACK_TOTAL, PIPELINE_DURATION, PIPELINE_RUNS_TOTAL, QUALITY_SCORE, QUEUE_DEPTH,
    REGISTRY, RETRIES_TOTAL, STAGE_DURATION, STAGE_FAULTS_TOTAL, TRANSITIONS_TOTAL,
};

//! Peer review between production stages.
//!
//! A stage checks its predecessor's output before building on it. Rejections
//! become [`FeedbackEntry`] records in the [`FeedbackTracker`], the
//! [`FeedbackTransformer`] turns the critique into corrective instructions,
//! and the [`PeerReviewPipeline`] re-runs the predecessor within a retry
//! bound.

mod pipeline;
mod tracker;
mod transformer;
mod types;

pub use pipeline::{
    extract_quality_score, PeerReviewPipeline, Recommendation, RunReport, WorkflowStats,
    DEFAULT_MAX_RETRIES,
};
pub use tracker::{FeedbackDigest, FeedbackSummary, FeedbackTracker, StageFeedbackStats, TOP_ISSUES};
pub use transformer::{FeedbackTransformer, Instruction, InstructionClass};
pub use types::{AgentResult, FeedbackEntry, ValidationResult};

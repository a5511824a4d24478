//! stage-forge: peer-reviewed multi-stage task orchestration.
//!
//! Tasks move through decomposition, implementation, testing, quality
//! assessment and integration. Each stage reviews its predecessor's output,
//! and rejected work is retried with the feedback folded into the task.

pub mod agents;
pub mod cli;
pub mod engine;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod review;
pub mod scheduler;
pub mod store;
pub mod task;
pub mod utils;

// Re-export commonly used error types
pub use error::{EngineError, LifecycleError, LlmError, PipelineError, StoreError};

//! Orchestration engine.
//!
//! [`OrchestrationEngine`] owns the lifecycle: it creates tasks and
//! projects, advances one task per call through [`StageOperations`], and
//! commits every transition through the shared [`crate::store::TaskStore`].
//! [`EngineConfig`] carries the timing and retry knobs.

pub mod config;
pub mod operations;
pub mod orchestrator;

pub use config::{ConfigError, EngineConfig};
pub use operations::{
    extract_code_artifacts, parse_subtasks, AgentStageOperations, StageOperations, StageOutcome,
};
pub use orchestrator::{OrchestrationEngine, ProcessOutcome};

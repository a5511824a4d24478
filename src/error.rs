//! Error types for stage-forge operations.
//!
//! Defines error types for the major subsystems:
//! - Completion service (LLM) interactions
//! - Task and project persistence
//! - Task lifecycle transitions
//! - Orchestration engine operations
//! - Peer-review pipeline runs

use thiserror::Error;

use crate::task::TaskStatus;

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Empty completion returned by model '{0}'")]
    EmptyCompletion(String),
}

/// Errors raised by a persistence backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to create storage directory '{path}': {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur when moving a task between lifecycle states.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("Task is in terminal state '{0}'")]
    Terminal(TaskStatus),
}

/// Errors surfaced by the orchestration engine's public operations.
///
/// Faults that happen while a task is being processed never surface as an
/// `EngineError`; they are recorded on the task as `ERROR` instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Project '{0}' not found")]
    ProjectNotFound(String),

    #[error("Parent task '{0}' not found")]
    ParentNotFound(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Persistence fault: {0}")]
    Store(#[from] StoreError),
}

/// Errors produced by a peer-review pipeline run.
///
/// The runner converts these into a failed `RunReport`; callers normally
/// inspect the report rather than the error itself.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Stage '{stage}' rejected the output of '{previous}': {feedback}")]
    ValidationRejected {
        stage: String,
        previous: String,
        feedback: String,
    },

    #[error("Max retries exceeded for {retried_stage} ({attempts} attempts). Last feedback: {feedback}")]
    RetryExhausted {
        stage: String,
        retried_stage: String,
        attempts: u32,
        feedback: String,
    },

    #[error("Stage '{stage}' failed: {reason}")]
    StageFault { stage: String, reason: String },

    #[error("A pipeline run for task '{0}' is already in flight")]
    RunInFlight(String),

    #[error("Pipeline has no stages")]
    EmptyPipeline,
}

impl PipelineError {
    /// Name of the stage the run failed at, when one applies.
    pub fn failed_at(&self) -> Option<&str> {
        match self {
            PipelineError::ValidationRejected { stage, .. }
            | PipelineError::RetryExhausted { stage, .. }
            | PipelineError::StageFault { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Short machine-readable tag for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ValidationRejected { .. } => "validation_rejected",
            PipelineError::RetryExhausted { .. } => "retry_exhausted",
            PipelineError::StageFault { .. } => "stage_fault",
            PipelineError::RunInFlight(_) => "run_in_flight",
            PipelineError::EmptyPipeline => "empty_pipeline",
        }
    }
}

//! Error types for stage agents.

use thiserror::Error;

use crate::error::LlmError;

/// Errors that can occur inside a stage's `validate` or `work`.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The completion service failed.
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// The completion could not be interpreted.
    #[error("Failed to parse LLM response: {0}")]
    ResponseParseError(String),

    /// The stage produced nothing usable.
    #[error("Stage '{0}' produced empty output")]
    EmptyOutput(String),

    /// The stage requires input from a previous stage but got none.
    #[error("Stage '{0}' requires output from the previous stage")]
    MissingInput(String),

    /// No agent registered for the requested stage.
    #[error("No agent configured for stage '{0}'")]
    StageNotConfigured(String),

    /// Timeout during agent operation.
    #[error("Agent operation timed out after {seconds} seconds")]
    Timeout { seconds: u64 },
}

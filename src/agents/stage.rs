use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::AgentError;
use crate::review::ValidationResult;
use crate::task::Task;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Decompose,
    Implement,
    Test,
    Assess,
    Integrate,
}

impl StageKind {
    /// All stages in production order.
    pub const ALL: [StageKind; 5] = [
        StageKind::Decompose,
        StageKind::Implement,
        StageKind::Test,
        StageKind::Assess,
        StageKind::Integrate,
    ];

    /// Stage order of a default peer-review run.
    pub const REVIEW_WORKFLOW: [StageKind; 4] = [
        StageKind::Decompose,
        StageKind::Implement,
        StageKind::Test,
        StageKind::Assess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Decompose => "decompose",
            StageKind::Implement => "implement",
            StageKind::Test => "test",
            StageKind::Assess => "assess",
            StageKind::Integrate => "integrate",
        }
    }

    /// Whether feedback for this stage gets testing-specific refinements.
    pub fn is_testing(&self) -> bool {
        matches!(self, StageKind::Test)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "decompose" | "decomposer" | "decomposition" => Ok(StageKind::Decompose),
            "implement" | "implementation" | "code_generation" | "code" => {
                Ok(StageKind::Implement)
            }
            "test" | "testing" | "tests" => Ok(StageKind::Test),
            "assess" | "quality" | "quality_assessment" | "quality_check" => {
                Ok(StageKind::Assess)
            }
            "integrate" | "integration" => Ok(StageKind::Integrate),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

/// Contract implemented by every production stage.
///
/// `validate` is never called on the first stage of a run. Implementations
/// must not retry internally; re-generation is driven by the pipeline with a
/// rewritten task description.
#[async_trait]
pub trait StageAgent: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Name used to key outputs, retry counts and feedback.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Judge the previous stage's output before building on it.
    async fn validate(
        &self,
        previous_output: &str,
        task: &Task,
    ) -> Result<ValidationResult, AgentError>;

    /// Produce this stage's output.
    async fn work(&self, task: &Task, previous_output: Option<&str>) -> Result<String, AgentError>;
}

//! Stage agents.
//!
//! Every production stage implements the [`StageAgent`] contract:
//! `validate` judges the previous stage's output and `work` produces this
//! stage's output. Concrete stages are tagged by [`StageKind`], so the
//! pipeline runner and the engine treat them uniformly.
//!
//! [`LlmStageAgent`] is the completion-service backed implementation used by
//! the binary; tests plug in scripted agents instead.

pub mod error;
pub mod llm_stage;
pub mod stage;

pub use error::AgentError;
pub use llm_stage::LlmStageAgent;
pub use stage::{StageAgent, StageKind};

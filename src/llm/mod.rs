//! Completion service integration.
//!
//! Stages never talk HTTP directly; they go through [`CompletionService`],
//! which turns a prompt plus [`ModelParams`] into text. [`LiteLlmClient`]
//! implements it against any OpenAI-compatible chat-completions endpoint.
//!
//! ```ignore
//! use stage_forge::llm::{CompletionService, LiteLlmClient, ModelParams};
//!
//! let client = LiteLlmClient::from_env()?;
//! let text = client.generate("Summarize this diff", &ModelParams::default()).await?;
//! ```
//!
//! Errors are reported to the caller as-is. Nothing in this module retries a
//! failed request; re-generation only happens through the peer-review retry
//! protocol, with a rewritten prompt.

mod litellm;

pub use litellm::{LiteLlmClient, Message, DEFAULT_MODEL};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::LlmError;

/// Sampling parameters for a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    /// Model identifier. Empty means the service's default model.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Optional system prompt sent ahead of the user prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.2,
            max_tokens: 4000,
            system_prompt: None,
        }
    }
}

impl ModelParams {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Anything that can turn a prompt into generated text.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn generate(&self, prompt: &str, params: &ModelParams) -> Result<String, LlmError>;
}

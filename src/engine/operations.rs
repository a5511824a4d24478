//! Stage operations invoked by the orchestration engine.
//!
//! The engine only knows the [`StageOperations`] contract. The default
//! implementation, [`AgentStageOperations`], maps each operation onto a
//! registered [`StageAgent`] and reads the inputs it needs from the task's
//! recorded payloads.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, warn};

use crate::agents::{AgentError, StageAgent, StageKind};
use crate::review::Recommendation;
use crate::task::{CodeArtifacts, CodeFile, Task};

static CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+\-]*)[^\n]*\n(.*?)```").expect("Invalid regex: CODE_BLOCK")
});

static PATH_COMMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?://|#|--|/\*)\s*(?:(?i:file|path):\s*)?([\w./\-]+\.[A-Za-z0-9]+)\s*(?:\*/)?\s*$")
        .expect("Invalid regex: PATH_COMMENT")
});

static NUMBERED_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\d+[.)]\s+(.+?)\s*$").expect("Invalid regex: NUMBERED_ITEM")
});

/// Result of the implement, test, assess and integrate operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    pub passed: bool,
    pub content: String,
    /// Code produced by the operation; only the implement operation fills it.
    pub artifacts: CodeArtifacts,
}

impl StageOutcome {
    pub fn passed(content: impl Into<String>) -> Self {
        Self {
            passed: true,
            content: content.into(),
            artifacts: CodeArtifacts::default(),
        }
    }

    pub fn failed(content: impl Into<String>) -> Self {
        Self {
            passed: false,
            content: content.into(),
            artifacts: CodeArtifacts::default(),
        }
    }
}

/// The work the engine performs for each stage of the lifecycle.
#[async_trait]
pub trait StageOperations: Send + Sync {
    /// Subtask descriptions; empty when the task needs no decomposition.
    async fn decompose(&self, task: &Task) -> Result<Vec<String>, AgentError>;

    async fn implement(&self, task: &Task) -> Result<StageOutcome, AgentError>;

    async fn test(&self, task: &Task) -> Result<StageOutcome, AgentError>;

    async fn assess(&self, task: &Task) -> Result<StageOutcome, AgentError>;

    async fn integrate(&self, task: &Task) -> Result<StageOutcome, AgentError>;
}

/// [`StageOperations`] backed by one [`StageAgent`] per [`StageKind`].
#[derive(Default)]
pub struct AgentStageOperations {
    agents: HashMap<StageKind, Arc<dyn StageAgent>>,
}

impl AgentStageOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `agent` for its kind, replacing any previous one.
    pub fn with_agent(mut self, agent: Arc<dyn StageAgent>) -> Self {
        self.agents.insert(agent.kind(), agent);
        self
    }

    pub fn from_agents(agents: impl IntoIterator<Item = Arc<dyn StageAgent>>) -> Self {
        agents.into_iter().fold(Self::new(), Self::with_agent)
    }

    fn agent(&self, kind: StageKind) -> Result<&Arc<dyn StageAgent>, AgentError> {
        self.agents
            .get(&kind)
            .ok_or_else(|| AgentError::StageNotConfigured(kind.as_str().to_string()))
    }

    /// Validate `input` with the agent for `kind`, then let it work on it.
    ///
    /// A rejected validation fails the stage without calling `work`.
    async fn review_then_work(
        &self,
        kind: StageKind,
        task: &Task,
        input: &str,
    ) -> Result<StageOutcome, AgentError> {
        let agent = self.agent(kind)?;
        let verdict = agent.validate(input, task).await?;
        if !verdict.is_valid {
            warn!(
                task_id = %task.id,
                stage = agent.name(),
                issues = verdict.issues.len(),
                "Stage input rejected"
            );
            let mut content = verdict.feedback.clone();
            if !verdict.issues.is_empty() {
                content.push_str("\nIssues:\n- ");
                content.push_str(&verdict.issues.join("\n- "));
            }
            return Ok(StageOutcome::failed(content));
        }
        let output = agent.work(task, Some(input)).await?;
        Ok(StageOutcome::passed(output))
    }
}

#[async_trait]
impl StageOperations for AgentStageOperations {
    async fn decompose(&self, task: &Task) -> Result<Vec<String>, AgentError> {
        let output = self.agent(StageKind::Decompose)?.work(task, None).await?;
        let subtasks = parse_subtasks(&output);
        debug!(task_id = %task.id, subtasks = subtasks.len(), "Decomposition parsed");
        Ok(subtasks)
    }

    async fn implement(&self, task: &Task) -> Result<StageOutcome, AgentError> {
        let output = self.agent(StageKind::Implement)?.work(task, None).await?;
        let artifacts = extract_code_artifacts(&output, &task.language);
        Ok(StageOutcome {
            passed: !artifacts.is_empty(),
            content: output,
            artifacts,
        })
    }

    async fn test(&self, task: &Task) -> Result<StageOutcome, AgentError> {
        if task.code.is_empty() {
            return Err(AgentError::MissingInput("test".to_string()));
        }
        self.review_then_work(StageKind::Test, task, &task.code.render())
            .await
    }

    async fn assess(&self, task: &Task) -> Result<StageOutcome, AgentError> {
        let report = task
            .test_results
            .as_ref()
            .ok_or_else(|| AgentError::MissingInput("assess".to_string()))?;
        let input = format!("{}\n\nTEST REPORT:\n{}", task.code.render(), report.content);
        let mut outcome = self.review_then_work(StageKind::Assess, task, &input).await?;
        if outcome.passed {
            outcome.passed = !matches!(
                Recommendation::from_output(&outcome.content),
                Recommendation::NeedsImprovement | Recommendation::Rejected
            );
        }
        Ok(outcome)
    }

    async fn integrate(&self, task: &Task) -> Result<StageOutcome, AgentError> {
        let report = task
            .quality_results
            .as_ref()
            .ok_or_else(|| AgentError::MissingInput("integrate".to_string()))?;
        self.review_then_work(StageKind::Integrate, task, &report.content)
            .await
    }
}

/// Parse a numbered list into subtask descriptions.
///
/// Output containing `NO SUBTASKS`, or no numbered lines, yields nothing.
pub fn parse_subtasks(output: &str) -> Vec<String> {
    if output.to_uppercase().contains("NO SUBTASKS") {
        return Vec::new();
    }
    output
        .lines()
        .filter_map(|line| NUMBERED_ITEM.captures(line))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|item| !item.is_empty())
        .collect()
}

/// Collect fenced code blocks into code files.
///
/// A block whose first line is a comment naming a path is stored under that
/// path (the comment is dropped); others get a generated name. Files whose
/// path contains "test" are filed as tests.
pub fn extract_code_artifacts(output: &str, language: &str) -> CodeArtifacts {
    let mut artifacts = CodeArtifacts::default();

    for (index, caps) in CODE_BLOCK.captures_iter(output).enumerate() {
        let fence_lang = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if body.trim().is_empty() {
            continue;
        }

        let first_line = body.lines().next().unwrap_or_default();
        let (path, content) = match PATH_COMMENT.captures(first_line) {
            Some(path_caps) => (
                path_caps[1].to_string(),
                body.split_once('\n').map(|(_, rest)| rest).unwrap_or_default(),
            ),
            None => {
                let lang = if fence_lang.is_empty() { language } else { fence_lang };
                (format!("generated_{}.{}", index + 1, extension_for(lang)), body)
            }
        };

        let file = CodeFile {
            path,
            content: content.trim_end().to_string(),
        };
        if file.path.to_lowercase().contains("test") {
            artifacts.tests.push(file);
        } else {
            artifacts.files.push(file);
        }
    }

    artifacts
}

fn extension_for(language: &str) -> &'static str {
    match language.to_ascii_lowercase().as_str() {
        "rust" | "rs" => "rs",
        "python" | "py" => "py",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "go" | "golang" => "go",
        "java" => "java",
        "c" => "c",
        "cpp" | "c++" => "cpp",
        "shell" | "bash" | "sh" => "sh",
        _ => "txt",
    }
}

//! Completion-service backed stage agent.
//!
//! One type covers every [`StageKind`]; the kind selects the prompts. The
//! validation prompts ask for a JSON verdict that
//! [`ValidationResult::from_response`] understands, and the assessment prompt
//! asks for the score and recommendation markers the pipeline extracts.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::error::AgentError;
use super::stage::{StageAgent, StageKind};
use crate::llm::{CompletionService, ModelParams};
use crate::review::ValidationResult;
use crate::task::Task;

/// Stands in for the previous stage's output when a stage opens the run.
const NO_PREVIOUS_OUTPUT: &str =
    "(No earlier stage output. Work from the task description and requirements.)";

const DECOMPOSE_PROMPT: &str = r#"You are a senior engineer splitting a development task into subtasks.

TASK: {description}
LANGUAGE: {language}
REQUIREMENTS:
{requirements}

If the task is small enough to implement in one step, answer with exactly: NO SUBTASKS
Otherwise list between 2 and 6 independent subtasks as a numbered list, one per line:
1. <subtask description>
2. <subtask description>"#;

const IMPLEMENT_PROMPT: &str = r#"You are an expert {language} developer.

TASK: {description}
REQUIREMENTS:
{requirements}

{context}Write complete, working {language} code for this task. Put every file in its own
fenced code block and start each block with a comment line naming the file path.
Include unit tests in separate files whose path contains "test"."#;

const TEST_PROMPT: &str = r#"You are a test engineer writing tests for the code below.

TASK: {description}
LANGUAGE: {language}

CODE UNDER TEST:
{previous}

Write a thorough test suite covering normal behaviour, edge cases and error handling.
End with a short TEST SUMMARY section listing what is covered."#;

const ASSESS_PROMPT: &str = r#"You are a code quality reviewer.

TASK: {description}

CODE AND TESTS:
{previous}

Assess correctness, readability, maintainability, security and test coverage.
Finish with exactly these two lines:
OVERALL QUALITY SCORE: <number from 0 to 10>
RECOMMENDATION: <one of APPROVED FOR INTEGRATION, NEEDS IMPROVEMENT, REJECTED>"#;

const INTEGRATE_PROMPT: &str = r#"You are integrating reviewed work into the main codebase.

TASK: {description}

QUALITY REPORT:
{previous}

Describe the integration steps, any follow-up work, and confirm the change is ready.
Start your answer with INTEGRATION READY or INTEGRATION BLOCKED."#;

const VALIDATION_PROMPT: &str = r#"Before doing my own work as the {stage} stage, I must check the output of the
{previous_stage} stage.

TASK: {description}

OUTPUT TO REVIEW:
{previous}

CHECKLIST:
{checklist}

Respond in JSON only:
{
  "is_valid": true,
  "confidence": 0.9,
  "issues": ["issue1", "issue2"],
  "feedback": "Specific, actionable feedback for the {previous_stage} stage",
  "can_proceed": true
}
Set is_valid to false only if the output must be regenerated."#;

/// A stage agent that delegates to a [`CompletionService`].
pub struct LlmStageAgent {
    kind: StageKind,
    name: String,
    service: Arc<dyn CompletionService>,
    params: ModelParams,
}

impl LlmStageAgent {
    pub fn new(kind: StageKind, service: Arc<dyn CompletionService>) -> Self {
        Self {
            kind,
            name: kind.as_str().to_string(),
            service,
            params: ModelParams::default(),
        }
    }

    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    /// Build one agent per stage kind sharing a service and parameters.
    pub fn for_stages(
        kinds: &[StageKind],
        service: Arc<dyn CompletionService>,
        params: &ModelParams,
    ) -> Vec<Arc<dyn StageAgent>> {
        kinds
            .iter()
            .map(|kind| {
                Arc::new(LlmStageAgent::new(*kind, service.clone()).with_params(params.clone()))
                    as Arc<dyn StageAgent>
            })
            .collect()
    }

    fn work_prompt(&self, task: &Task, previous_output: Option<&str>) -> String {
        let requirements = format_requirements(&task.requirements);
        let prompt = match self.kind {
            StageKind::Decompose => DECOMPOSE_PROMPT.to_string(),
            StageKind::Implement => {
                let context = previous_output
                    .filter(|p| !p.trim().is_empty())
                    .map(|p| format!("CONTEXT FROM PLANNING:\n{}\n\n", p))
                    .unwrap_or_default();
                IMPLEMENT_PROMPT.replace("{context}", &context)
            }
            StageKind::Test | StageKind::Assess | StageKind::Integrate => {
                // First stage of a run: only the task description is available.
                let previous = previous_output
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or(NO_PREVIOUS_OUTPUT);
                let template = match self.kind {
                    StageKind::Test => TEST_PROMPT,
                    StageKind::Assess => ASSESS_PROMPT,
                    _ => INTEGRATE_PROMPT,
                };
                template.replace("{previous}", previous)
            }
        };

        prompt
            .replace("{description}", &task.description)
            .replace("{language}", &task.language)
            .replace("{requirements}", &requirements)
    }

    fn validation_prompt(&self, previous_output: &str, task: &Task) -> String {
        let (previous_stage, checklist) = match self.kind {
            StageKind::Decompose => ("intake", "1. Is the task description actionable?"),
            StageKind::Implement => (
                "decompose",
                "1. Is the plan consistent with the task?\n\
                 2. Are the subtasks concrete enough to implement?",
            ),
            StageKind::Test => (
                "implement",
                "1. Does the code have clear interfaces?\n\
                 2. Are there syntax errors or missing imports?\n\
                 3. Does the code address the task requirements?\n\
                 4. Is the code structured so it can be tested?\n\
                 5. Is error handling implemented?",
            ),
            StageKind::Assess => (
                "test",
                "1. Do the tests exercise the main behaviour?\n\
                 2. Are edge cases and error paths covered?\n\
                 3. Are the tests isolated and repeatable?",
            ),
            StageKind::Integrate => (
                "assess",
                "1. Does the quality report contain a score and recommendation?\n\
                 2. Are blocking issues resolved?",
            ),
        };

        VALIDATION_PROMPT
            .replace("{stage}", self.kind.as_str())
            .replace("{previous_stage}", previous_stage)
            .replace("{checklist}", checklist)
            .replace("{description}", &task.description)
            .replace("{previous}", previous_output)
    }
}

fn format_requirements(requirements: &[String]) -> String {
    if requirements.is_empty() {
        return "- (none listed)".to_string();
    }
    requirements
        .iter()
        .map(|r| format!("- {}", r))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
impl StageAgent for LlmStageAgent {
    fn kind(&self) -> StageKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(
        &self,
        previous_output: &str,
        task: &Task,
    ) -> Result<ValidationResult, AgentError> {
        let prompt = self.validation_prompt(previous_output, task);
        let response = self.service.generate(&prompt, &self.params).await?;
        let result = ValidationResult::from_response(&response);
        debug!(
            stage = %self.name,
            task_id = %task.id,
            is_valid = result.is_valid,
            confidence = result.confidence,
            "Validation complete"
        );
        Ok(result)
    }

    async fn work(&self, task: &Task, previous_output: Option<&str>) -> Result<String, AgentError> {
        let prompt = self.work_prompt(task, previous_output);
        let output = self.service.generate(&prompt, &self.params).await?;
        if output.trim().is_empty() {
            return Err(AgentError::EmptyOutput(self.name.clone()));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use std::sync::Mutex;

    /// Records prompts and replays a fixed response.
    struct MockCompletion {
        response: String,
        prompts: Mutex<Vec<String>>,
    }

    impl MockCompletion {
        fn new(response: impl Into<String>) -> Self {
            Self {
                response: response.into(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionService for MockCompletion {
        async fn generate(&self, prompt: &str, _params: &ModelParams) -> Result<String, LlmError> {
            self.prompts
                .lock()
                .expect("lock poisoned")
                .push(prompt.to_string());
            Ok(self.response.clone())
        }
    }

    #[tokio::test]
    async fn test_validate_parses_verdict() {
        let service = Arc::new(MockCompletion::new(
            r#"{"is_valid": false, "confidence": 0.7, "issues": ["no tests"], "feedback": "missing unit tests"}"#,
        ));
        let agent = LlmStageAgent::new(StageKind::Test, service.clone());
        let task = Task::new("Add input validation to the parser", "rust");

        let verdict = agent.validate("fn parse() {}", &task).await.unwrap();
        assert!(!verdict.is_valid);
        assert_eq!(verdict.feedback, "missing unit tests");

        let prompts = service.prompts.lock().unwrap();
        assert!(prompts[0].contains("fn parse() {}"));
        assert!(prompts[0].contains("implement stage"));
    }

    #[tokio::test]
    async fn test_downstream_stage_without_input_works_from_description() {
        let service = Arc::new(MockCompletion::new("OVERALL QUALITY SCORE: 6"));
        let agent = LlmStageAgent::new(StageKind::Assess, service.clone());
        let task = Task::new("Add input validation to the parser", "rust");

        let output = agent.work(&task, None).await.unwrap();
        assert_eq!(output, "OVERALL QUALITY SCORE: 6");

        let prompts = service.prompts.lock().unwrap();
        assert!(prompts[0].contains("Add input validation to the parser"));
        assert!(prompts[0].contains(NO_PREVIOUS_OUTPUT));
    }

    #[tokio::test]
    async fn test_work_rejects_empty_completion() {
        let agent = LlmStageAgent::new(StageKind::Implement, Arc::new(MockCompletion::new("  ")));
        let err = agent
            .work(&Task::new("t", "rust"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::EmptyOutput(_)));
    }

    #[tokio::test]
    async fn test_work_prompt_includes_requirements() {
        let service = Arc::new(MockCompletion::new("1. first\n2. second"));
        let agent = LlmStageAgent::new(StageKind::Decompose, service.clone());
        let task = Task::new("Build a CSV reader", "rust")
            .with_requirements(vec!["streaming".to_string()]);

        agent.work(&task, None).await.unwrap();
        let prompts = service.prompts.lock().unwrap();
        assert!(prompts[0].contains("Build a CSV reader"));
        assert!(prompts[0].contains("- streaming"));
    }

    #[test]
    fn test_for_stages_builds_named_agents() {
        let agents = LlmStageAgent::for_stages(
            &StageKind::REVIEW_WORKFLOW,
            Arc::new(MockCompletion::new("x")),
            &ModelParams::default(),
        );
        let names: Vec<_> = agents.iter().map(|a| a.name().to_string()).collect();
        assert_eq!(names, vec!["decompose", "implement", "test", "assess"]);
    }
}

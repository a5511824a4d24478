//! End-to-end peer-review runs through completion-backed stage agents.
//!
//! The completion service is scripted, so every prompt the stages send and
//! every response they parse is deterministic.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use stage_forge::agents::{LlmStageAgent, StageKind};
use stage_forge::llm::{CompletionService, ModelParams};
use stage_forge::review::{FeedbackTracker, PeerReviewPipeline, Recommendation};
use stage_forge::task::Task;
use stage_forge::LlmError;

/// Replays queued responses in call order and records every prompt.
struct QueuedCompletion {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
}

impl QueuedCompletion {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionService for QueuedCompletion {
    async fn generate(&self, prompt: &str, _params: &ModelParams) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::EmptyCompletion("scripted".to_string()))
    }
}

const CODE: &str = "```rust\npub fn parse(input: &str) -> Result<(), String> { Ok(()) }\n```";
const CODE_WITH_CHECK: &str = "```rust\npub fn parse(input: &str) -> Result<(), String> {\n    if input.is_empty() { return Err(\"empty\".into()); }\n    Ok(())\n}\n```";
const TESTS: &str = "```rust\n#[test]\nfn rejects_empty() {}\n```";
const REJECT_EDGE_CASE: &str = r#"{"is_valid": false, "confidence": 0.9, "issues": ["no empty input check"], "feedback": "missing edge case handling for empty input", "can_proceed": false}"#;
const ACCEPT: &str = r#"{"is_valid": true, "confidence": 0.95, "issues": [], "feedback": "looks good", "can_proceed": true}"#;

fn pipeline_for(
    kinds: &[StageKind],
    service: Arc<QueuedCompletion>,
    tracker: Arc<FeedbackTracker>,
) -> PeerReviewPipeline {
    let agents = LlmStageAgent::for_stages(kinds, service, &ModelParams::default());
    PeerReviewPipeline::new(agents, tracker)
}

#[tokio::test]
async fn test_rejected_implementation_is_retried_with_feedback() {
    // implement.work, test.validate (reject), implement.work, test.validate, test.work
    let service = QueuedCompletion::new(&[CODE, REJECT_EDGE_CASE, CODE_WITH_CHECK, ACCEPT, TESTS]);
    let tracker = Arc::new(FeedbackTracker::new());
    let pipeline = pipeline_for(
        &[StageKind::Implement, StageKind::Test],
        service.clone(),
        tracker.clone(),
    );

    let task = Task::new("Add input validation to the parser", "rust");
    let report = pipeline.run(&task).await;

    assert!(report.success, "run failed: {:?}", report.failure_reason);
    assert_eq!(report.retry_counts.get("implement"), Some(&1));
    assert_eq!(report.outputs["implement"], CODE_WITH_CHECK);
    assert_eq!(report.outputs["test"], TESTS);

    let entries = tracker.entries_for_task(&task.id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].from_stage, "test");
    assert_eq!(entries[0].to_stage, "implement");
    assert_eq!(entries[0].feedback, "missing edge case handling for empty input");
    assert_eq!(entries[0].retry_successful, Some(true));

    let prompts = service.prompts();
    assert_eq!(prompts.len(), 5);
    assert!(!prompts[0].contains("Include edge case handling for empty input"));
    assert!(prompts[2].contains("Add input validation to the parser"));
    assert!(prompts[2].contains("Include edge case handling for empty input"));
}

#[tokio::test]
async fn test_exhausted_retries_report_last_feedback() {
    let service = QueuedCompletion::new(&[
        CODE,
        REJECT_EDGE_CASE,
        CODE,
        REJECT_EDGE_CASE,
        CODE,
        REJECT_EDGE_CASE,
    ]);
    let tracker = Arc::new(FeedbackTracker::new());
    let pipeline = pipeline_for(
        &[StageKind::Implement, StageKind::Test],
        service.clone(),
        tracker.clone(),
    );

    let report = pipeline.run(&Task::new("Add input validation to the parser", "rust")).await;

    assert!(!report.success);
    assert_eq!(report.failed_at.as_deref(), Some("test"));
    assert_eq!(report.failure_kind.as_deref(), Some("retry_exhausted"));
    assert!(report
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .contains("missing edge case handling for empty input"));
    assert_eq!(report.retry_counts.get("implement"), Some(&2));
    assert_eq!(service.prompts().len(), 6);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["success"], false);
    assert_eq!(json["retry_counts"]["implement"], 2);
}

#[tokio::test]
async fn test_non_json_verdict_is_treated_as_rejection() {
    let service = QueuedCompletion::new(&[CODE, "Looks fine to me!", CODE, ACCEPT, TESTS]);
    let tracker = Arc::new(FeedbackTracker::new());
    let pipeline = pipeline_for(
        &[StageKind::Implement, StageKind::Test],
        service,
        tracker.clone(),
    )
    .with_max_retries(1);

    let report = pipeline.run(&Task::new("Add input validation", "rust")).await;

    assert!(report.success);
    let entries = tracker.entries();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].feedback.contains("not in the expected JSON format"));
}

#[tokio::test]
async fn test_completion_failure_is_a_stage_fault() {
    let service = QueuedCompletion::new(&[CODE]);
    let pipeline = pipeline_for(
        &[StageKind::Implement, StageKind::Test],
        service,
        Arc::new(FeedbackTracker::new()),
    );

    let report = pipeline.run(&Task::new("Add input validation", "rust")).await;

    assert!(!report.success);
    assert_eq!(report.failed_at.as_deref(), Some("test"));
    assert_eq!(report.failure_kind.as_deref(), Some("stage_fault"));
    assert_eq!(report.outputs["implement"], CODE);
}

#[tokio::test]
async fn test_assessment_score_and_recommendation() {
    let assessment = "Clean structure.\nOVERALL QUALITY SCORE: 7.5\nRECOMMENDATION: NEEDS IMPROVEMENT";
    let service = QueuedCompletion::new(&[TESTS, ACCEPT, assessment]);
    let pipeline = pipeline_for(
        &[StageKind::Test, StageKind::Assess],
        service,
        Arc::new(FeedbackTracker::new()),
    );

    let report = pipeline.run(&Task::new("Add input validation", "rust")).await;

    assert!(report.success);
    assert_eq!(report.quality_score, 7.5);
    assert_eq!(report.recommendation, Recommendation::NeedsImprovement);
}

#[tokio::test]
async fn test_feedback_log_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let task = Task::new("Add input validation to the parser", "rust");

    {
        let tracker = Arc::new(FeedbackTracker::open(dir.path()).await.unwrap());
        let service =
            QueuedCompletion::new(&[CODE, REJECT_EDGE_CASE, CODE_WITH_CHECK, ACCEPT, TESTS]);
        let pipeline = pipeline_for(&[StageKind::Implement, StageKind::Test], service, tracker);
        assert!(pipeline.run(&task).await.success);
    }

    let reopened = FeedbackTracker::open(dir.path()).await.unwrap();
    let entries = reopened.entries_for_task(&task.id);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].retry_successful, Some(true));

    let stats = reopened.stage_stats("implement");
    assert_eq!(stats.received_count, 1);
    assert_eq!(stats.retry_success_rate, 1.0);
}

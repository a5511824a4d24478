//! Peer-review pipeline runner.
//!
//! Runs an ordered list of stages. Every stage after the first validates its
//! predecessor's output before working on it; a rejection records feedback
//! and re-runs the predecessor with an enhanced task description, up to the
//! retry bound.
//!
//! Each `validate` and `work` call runs in its own tokio task, so an agent
//! that panics ends the run with a `stage_fault` report instead of unwinding
//! through the caller.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::tracker::{FeedbackSummary, FeedbackTracker, StageFeedbackStats};
use super::transformer::FeedbackTransformer;
use super::types::{AgentResult, FeedbackEntry, ValidationResult};
use crate::agents::{AgentError, StageAgent, StageKind};
use crate::error::PipelineError;
use crate::metrics::MetricsCollector;
use crate::task::Task;

/// Default number of re-runs allowed per stage per run.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Window and size of the recent feedback included in workflow stats.
const RECENT_FEEDBACK_HOURS: u32 = 24;
const RECENT_FEEDBACK_LIMIT: usize = 10;

static QUALITY_SCORE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"OVERALL QUALITY SCORE:\s*(\d+(?:\.\d+)?)")
        .expect("Invalid regex: QUALITY_SCORE_PATTERN")
});

/// Final recommendation extracted from an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Recommendation {
    Approved,
    NeedsImprovement,
    Rejected,
    Unknown,
}

impl Recommendation {
    /// Markers are checked in order; the first one present wins.
    pub fn from_output(output: &str) -> Self {
        if output.contains("APPROVED FOR INTEGRATION") {
            Recommendation::Approved
        } else if output.contains("NEEDS IMPROVEMENT") {
            Recommendation::NeedsImprovement
        } else if output.contains("REJECTED") {
            Recommendation::Rejected
        } else {
            Recommendation::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Approved => "APPROVED",
            Recommendation::NeedsImprovement => "NEEDS_IMPROVEMENT",
            Recommendation::Rejected => "REJECTED",
            Recommendation::Unknown => "UNKNOWN",
        }
    }
}

/// Extract the `OVERALL QUALITY SCORE` value, or 0.0 when absent.
pub fn extract_quality_score(output: &str) -> f64 {
    QUALITY_SCORE_PATTERN
        .captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .unwrap_or(0.0)
}

/// Aggregated result of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub task_id: String,
    pub success: bool,
    pub execution_time_secs: f64,
    /// Final output of every stage that completed, keyed by stage name.
    pub outputs: BTreeMap<String, String>,
    pub agent_results: BTreeMap<String, AgentResult>,
    pub feedback_summary: FeedbackSummary,
    /// Retries consumed per stage; stages never retried are absent.
    pub retry_counts: BTreeMap<String, u32>,
    pub quality_score: f64,
    pub recommendation: Recommendation,
    pub failed_at: Option<String>,
    pub failure_reason: Option<String>,
    pub failure_kind: Option<String>,
}

impl RunReport {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            success: false,
            execution_time_secs: 0.0,
            outputs: BTreeMap::new(),
            agent_results: BTreeMap::new(),
            feedback_summary: FeedbackSummary::default(),
            retry_counts: BTreeMap::new(),
            quality_score: 0.0,
            recommendation: Recommendation::Unknown,
            failed_at: None,
            failure_reason: None,
            failure_kind: None,
        }
    }

    fn fail(&mut self, error: &PipelineError) {
        self.success = false;
        self.failed_at = error.failed_at().map(str::to_string);
        self.failure_reason = Some(error.to_string());
        self.failure_kind = Some(error.kind().to_string());
    }
}

/// Snapshot of pipeline configuration and feedback statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStats {
    pub feedback_stats: BTreeMap<String, StageFeedbackStats>,
    pub recent_feedback: Vec<FeedbackEntry>,
    pub workflow_agents: Vec<String>,
    pub max_retries: u32,
}

/// Clears a task's in-flight marker and retry counts when its run ends.
struct RunGuard<'a> {
    active: &'a Mutex<HashSet<String>>,
    retry_counts: &'a Mutex<HashMap<String, BTreeMap<String, u32>>>,
    task_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut counts) = self.retry_counts.lock() {
            counts.remove(&self.task_id);
        }
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.task_id);
        }
    }
}

/// Run one agent call in its own task; errors and panics become stage faults.
async fn contained<T, F>(stage: &str, call: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, AgentError>> + Send + 'static,
{
    match tokio::spawn(call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PipelineError::StageFault {
            stage: stage.to_string(),
            reason: e.to_string(),
        }),
        Err(join_error) => Err(PipelineError::StageFault {
            stage: stage.to_string(),
            reason: format!("panicked: {}", join_error),
        }),
    }
}

/// Drives tasks through an ordered list of peer-reviewing stages.
pub struct PeerReviewPipeline {
    stages: Vec<Arc<dyn StageAgent>>,
    tracker: Arc<FeedbackTracker>,
    transformer: FeedbackTransformer,
    max_retries: u32,
    retry_counts: Mutex<HashMap<String, BTreeMap<String, u32>>>,
    active_runs: Mutex<HashSet<String>>,
    metrics: MetricsCollector,
}

impl PeerReviewPipeline {
    pub fn new(stages: Vec<Arc<dyn StageAgent>>, tracker: Arc<FeedbackTracker>) -> Self {
        Self {
            stages,
            tracker,
            transformer: FeedbackTransformer::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_counts: Mutex::new(HashMap::new()),
            active_runs: Mutex::new(HashSet::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn tracker(&self) -> &Arc<FeedbackTracker> {
        &self.tracker
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Retry counts of the run in flight for `task_id`; empty when idle.
    pub fn retry_counts(&self, task_id: &str) -> BTreeMap<String, u32> {
        self.retry_counts
            .lock()
            .expect("retry_counts lock poisoned")
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.active_runs
            .lock()
            .expect("active_runs lock poisoned")
            .contains(task_id)
    }

    /// Run every stage for `task`.
    ///
    /// Never returns an error: faults are reported through
    /// `failed_at`, `failure_reason` and `failure_kind`. A run for a task
    /// that already has one in flight is refused without touching its
    /// retry counts.
    pub async fn run(&self, task: &Task) -> RunReport {
        let started = Instant::now();
        let mut report = RunReport::new(&task.id);

        let _guard = match self.begin_run(&task.id) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(task_id = %task.id, "{}", e);
                report.fail(&e);
                return report;
            }
        };

        info!(task_id = %task.id, stages = ?self.stage_names(), "Starting peer-review run");

        let outcome = self.execute(task, &mut report).await;

        report.execution_time_secs = started.elapsed().as_secs_f64();
        report.retry_counts = self.retry_counts(&task.id);
        report.feedback_summary = self.tracker.summary_for_task(&task.id);

        match outcome {
            Ok(()) => {
                report.success = true;
                let assessed = self
                    .stages
                    .iter()
                    .rev()
                    .find(|s| s.kind() == StageKind::Assess)
                    .or_else(|| self.stages.last())
                    .and_then(|s| report.outputs.get(s.name()));
                if let Some(output) = assessed {
                    report.quality_score = extract_quality_score(output);
                    report.recommendation = Recommendation::from_output(output);
                }
                info!(
                    task_id = %task.id,
                    duration_secs = report.execution_time_secs,
                    quality_score = report.quality_score,
                    recommendation = report.recommendation.as_str(),
                    "Peer-review run completed"
                );
                self.metrics
                    .record_pipeline_run("success", report.execution_time_secs);
                self.metrics.record_quality_score(report.quality_score);
            }
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    failed_at = ?e.failed_at(),
                    error = %e,
                    "Peer-review run failed"
                );
                report.fail(&e);
                self.metrics
                    .record_pipeline_run(e.kind(), report.execution_time_secs);
            }
        }

        report
    }

    /// Pipeline configuration plus tracker statistics.
    pub fn workflow_stats(&self) -> WorkflowStats {
        WorkflowStats {
            feedback_stats: self.tracker.all_stats(),
            recent_feedback: self
                .tracker
                .recent(RECENT_FEEDBACK_HOURS, RECENT_FEEDBACK_LIMIT),
            workflow_agents: self.stage_names(),
            max_retries: self.max_retries,
        }
    }

    fn begin_run(&self, task_id: &str) -> Result<RunGuard<'_>, PipelineError> {
        if self.stages.is_empty() {
            return Err(PipelineError::EmptyPipeline);
        }
        {
            let mut active = self.active_runs.lock().expect("active_runs lock poisoned");
            if !active.insert(task_id.to_string()) {
                return Err(PipelineError::RunInFlight(task_id.to_string()));
            }
        }
        self.retry_counts
            .lock()
            .expect("retry_counts lock poisoned")
            .insert(task_id.to_string(), BTreeMap::new());
        Ok(RunGuard {
            active: &self.active_runs,
            retry_counts: &self.retry_counts,
            task_id: task_id.to_string(),
        })
    }

    async fn execute(&self, task: &Task, report: &mut RunReport) -> Result<(), PipelineError> {
        // Outputs by stage index; retries overwrite the predecessor's slot.
        let mut produced: Vec<String> = Vec::with_capacity(self.stages.len());

        for (index, stage) in self.stages.iter().enumerate() {
            let started = Instant::now();
            let mut result = AgentResult::new(stage.name(), &task.id);

            if index > 0 {
                let retries = self
                    .review_previous(index, task, &mut produced, &mut result)
                    .await?;
                result.retry_attempt = retries;
                if retries > 0 {
                    report
                        .outputs
                        .insert(self.stages[index - 1].name().to_string(), produced[index - 1].clone());
                }
            }

            let input = index.checked_sub(1).map(|i| produced[i].clone());
            let output = self.work(stage, task, input).await?;

            let elapsed = started.elapsed().as_secs_f64();
            self.metrics.record_stage_duration(stage.name(), elapsed);
            result.success = true;
            result.content = output.clone();
            result.execution_time = elapsed;

            info!(
                task_id = %task.id,
                stage = stage.name(),
                duration_secs = elapsed,
                "Stage completed"
            );

            report.outputs.insert(stage.name().to_string(), output.clone());
            report.agent_results.insert(stage.name().to_string(), result);
            produced.push(output);
        }

        Ok(())
    }

    /// Validate the predecessor's output, re-running it on rejection.
    ///
    /// Returns the number of retries spent. On success `produced[index - 1]`
    /// holds the accepted output.
    async fn review_previous(
        &self,
        index: usize,
        task: &Task,
        produced: &mut [String],
        result: &mut AgentResult,
    ) -> Result<u32, PipelineError> {
        let stage = &self.stages[index];
        let previous = &self.stages[index - 1];

        let mut validation = self.validate(stage, &produced[index - 1], task).await?;
        *result = result.clone().with_validation(validation.clone());

        let mut retries = 0;
        while !validation.is_valid {
            self.record_feedback(stage.as_ref(), previous.as_ref(), task, &validation)
                .await;

            let attempts = self.current_retries(&task.id, previous.name());
            if attempts >= self.max_retries {
                if self.max_retries == 0 {
                    return Err(PipelineError::ValidationRejected {
                        stage: stage.name().to_string(),
                        previous: previous.name().to_string(),
                        feedback: validation.feedback,
                    });
                }
                return Err(PipelineError::RetryExhausted {
                    stage: stage.name().to_string(),
                    retried_stage: previous.name().to_string(),
                    attempts,
                    feedback: validation.feedback,
                });
            }

            let attempt = self.bump_retry(&task.id, previous.name());
            retries += 1;

            let mut revised = task.clone();
            revised.description = self.transformer.enhance_description(
                &task.description,
                &validation.feedback,
                previous.kind(),
            );
            info!(
                task_id = %task.id,
                stage = previous.name(),
                attempt,
                max_retries = self.max_retries,
                "Re-running stage with enhanced description"
            );

            let input = index.checked_sub(2).map(|i| produced[i].clone());
            produced[index - 1] = self.work(previous, &revised, input).await?;

            validation = self.validate(stage, &produced[index - 1], &revised).await?;
            let success = validation.is_valid;
            self.metrics.record_retry(previous.name(), success);
            if let Err(e) = self
                .tracker
                .update_retry_result(&task.id, stage.name(), previous.name(), success)
                .await
            {
                warn!(task_id = %task.id, error = %e, "Failed to persist retry outcome");
            }

            result.retry_attempt = retries;
            *result = result.clone().with_validation(validation.clone());
        }

        Ok(retries)
    }

    async fn work(
        &self,
        stage: &Arc<dyn StageAgent>,
        task: &Task,
        input: Option<String>,
    ) -> Result<String, PipelineError> {
        let agent = Arc::clone(stage);
        let task = task.clone();
        contained(stage.name(), async move {
            agent.work(&task, input.as_deref()).await
        })
        .await
    }

    async fn validate(
        &self,
        stage: &Arc<dyn StageAgent>,
        previous_output: &str,
        task: &Task,
    ) -> Result<ValidationResult, PipelineError> {
        let agent = Arc::clone(stage);
        let previous_output = previous_output.to_string();
        let owned_task = task.clone();
        let validation = contained(stage.name(), async move {
            agent.validate(&previous_output, &owned_task).await
        })
        .await?;
        if !validation.is_valid {
            warn!(
                task_id = %task.id,
                stage = stage.name(),
                confidence = validation.confidence,
                issues = validation.issues.len(),
                "Validation rejected previous output"
            );
        }
        Ok(validation)
    }

    async fn record_feedback(
        &self,
        from: &dyn StageAgent,
        to: &dyn StageAgent,
        task: &Task,
        validation: &ValidationResult,
    ) {
        let entry = FeedbackEntry::from_validation(from.name(), to.name(), &task.id, validation);
        self.metrics.record_feedback(from.name(), to.name());
        if let Err(e) = self.tracker.record(entry).await {
            warn!(task_id = %task.id, error = %e, "Failed to persist feedback entry");
        }
    }

    fn current_retries(&self, task_id: &str, stage: &str) -> u32 {
        self.retry_counts
            .lock()
            .expect("retry_counts lock poisoned")
            .get(task_id)
            .and_then(|counts| counts.get(stage).copied())
            .unwrap_or(0)
    }

    fn bump_retry(&self, task_id: &str, stage: &str) -> u32 {
        let mut counts = self.retry_counts.lock().expect("retry_counts lock poisoned");
        let count = counts
            .entry(task_id.to_string())
            .or_default()
            .entry(stage.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    /// Replays scripted verdicts and counts calls.
    struct ScriptedStage {
        kind: StageKind,
        output: String,
        verdicts: Mutex<VecDeque<ValidationResult>>,
        work_calls: Mutex<Vec<String>>,
    }

    impl ScriptedStage {
        fn new(kind: StageKind, output: &str) -> Self {
            Self {
                kind,
                output: output.to_string(),
                verdicts: Mutex::new(VecDeque::new()),
                work_calls: Mutex::new(Vec::new()),
            }
        }

        fn with_verdicts(self, verdicts: Vec<ValidationResult>) -> Self {
            *self.verdicts.lock().unwrap() = verdicts.into();
            self
        }

        fn work_count(&self) -> usize {
            self.work_calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl StageAgent for ScriptedStage {
        fn kind(&self) -> StageKind {
            self.kind
        }

        async fn validate(
            &self,
            _previous_output: &str,
            _task: &Task,
        ) -> Result<ValidationResult, AgentError> {
            Ok(self
                .verdicts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ValidationResult::accept("ok")))
        }

        async fn work(&self, task: &Task, _previous: Option<&str>) -> Result<String, AgentError> {
            self.work_calls.lock().unwrap().push(task.description.clone());
            Ok(self.output.clone())
        }
    }

    /// Accepts its input, then panics while working.
    struct PanickingStage;

    #[async_trait]
    impl StageAgent for PanickingStage {
        fn kind(&self) -> StageKind {
            StageKind::Assess
        }

        async fn validate(
            &self,
            _previous_output: &str,
            _task: &Task,
        ) -> Result<ValidationResult, AgentError> {
            Ok(ValidationResult::accept("ok"))
        }

        async fn work(&self, _task: &Task, _previous: Option<&str>) -> Result<String, AgentError> {
            panic!("assessment exploded");
        }
    }

    /// Blocks in `work` until released.
    #[derive(Default)]
    struct GatedStage {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl StageAgent for GatedStage {
        fn kind(&self) -> StageKind {
            StageKind::Implement
        }

        async fn validate(
            &self,
            _previous_output: &str,
            _task: &Task,
        ) -> Result<ValidationResult, AgentError> {
            Ok(ValidationResult::accept("ok"))
        }

        async fn work(&self, _task: &Task, _previous: Option<&str>) -> Result<String, AgentError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("code".to_string())
        }
    }

    fn rejections(n: usize) -> Vec<ValidationResult> {
        (0..n)
            .map(|_| ValidationResult::reject("missing error handling", vec!["errors".into()]))
            .collect()
    }

    #[tokio::test]
    async fn test_single_stage_runs_once_without_feedback() {
        let stage = Arc::new(ScriptedStage::new(StageKind::Implement, "fn main() {}"));
        let tracker = Arc::new(FeedbackTracker::new());
        let pipeline = PeerReviewPipeline::new(vec![stage.clone()], tracker.clone());

        let report = pipeline.run(&Task::new("t", "rust")).await;
        assert!(report.success);
        assert_eq!(stage.work_count(), 1);
        assert!(tracker.is_empty());
        assert!(report.retry_counts.is_empty());
    }

    #[tokio::test]
    async fn test_always_rejecting_validator_exhausts_retries() {
        let implement = Arc::new(ScriptedStage::new(StageKind::Implement, "code"));
        let test = Arc::new(ScriptedStage::new(StageKind::Test, "tests").with_verdicts(rejections(10)));
        let tracker = Arc::new(FeedbackTracker::new());
        let pipeline =
            PeerReviewPipeline::new(vec![implement.clone(), test.clone()], tracker.clone());

        let report = pipeline.run(&Task::new("t", "rust")).await;
        assert!(!report.success);
        assert_eq!(implement.work_count(), 3);
        assert_eq!(test.work_count(), 0);
        assert_eq!(report.failed_at.as_deref(), Some("test"));
        assert_eq!(report.failure_kind.as_deref(), Some("retry_exhausted"));
        assert!(report
            .failure_reason
            .unwrap()
            .contains("Max retries exceeded for implement"));
        assert_eq!(report.retry_counts.get("implement"), Some(&2));
        assert_eq!(tracker.len(), 3);
    }

    #[tokio::test]
    async fn test_zero_retry_bound_rejects_immediately() {
        let implement = Arc::new(ScriptedStage::new(StageKind::Implement, "code"));
        let test = Arc::new(ScriptedStage::new(StageKind::Test, "tests").with_verdicts(rejections(1)));
        let pipeline = PeerReviewPipeline::new(
            vec![implement.clone(), test],
            Arc::new(FeedbackTracker::new()),
        )
        .with_max_retries(0);

        let report = pipeline.run(&Task::new("t", "rust")).await;
        assert_eq!(report.failure_kind.as_deref(), Some("validation_rejected"));
        assert_eq!(implement.work_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_uses_enhanced_description() {
        let implement = Arc::new(ScriptedStage::new(StageKind::Implement, "code"));
        let test = Arc::new(ScriptedStage::new(StageKind::Test, "tests").with_verdicts(vec![
            ValidationResult::reject("missing edge case handling for empty input", vec![]),
        ]));
        let tracker = Arc::new(FeedbackTracker::new());
        let pipeline =
            PeerReviewPipeline::new(vec![implement.clone(), test.clone()], tracker.clone());

        let report = pipeline
            .run(&Task::new("Add input validation to the parser", "rust"))
            .await;
        assert!(report.success);
        assert_eq!(report.retry_counts.get("implement"), Some(&1));

        let calls = implement.work_calls.lock().unwrap().clone();
        assert_eq!(calls[0], "Add input validation to the parser");
        assert!(calls[1].contains("Include edge case handling for empty input"));

        let entries = tracker.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].retry_successful, Some(true));
        assert_eq!(report.agent_results["test"].retry_attempt, 1);
    }

    #[tokio::test]
    async fn test_panicking_stage_is_reported_as_fault() {
        let implement = Arc::new(ScriptedStage::new(StageKind::Implement, "code"));
        let test = Arc::new(ScriptedStage::new(StageKind::Test, "tests").with_verdicts(rejections(1)));
        let pipeline = PeerReviewPipeline::new(
            vec![implement, test, Arc::new(PanickingStage)],
            Arc::new(FeedbackTracker::new()),
        );
        let task = Task::new("t", "rust");

        let report = pipeline.run(&task).await;
        assert!(!report.success);
        assert_eq!(report.failed_at.as_deref(), Some("assess"));
        assert_eq!(report.failure_kind.as_deref(), Some("stage_fault"));
        assert!(report.failure_reason.unwrap().contains("panicked"));
        assert_eq!(report.retry_counts.get("implement"), Some(&1));
        assert!(!pipeline.is_running(&task.id));
        assert!(pipeline.retry_counts(&task.id).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_run_for_same_task_is_refused() {
        let stage = Arc::new(GatedStage::default());
        let pipeline = Arc::new(PeerReviewPipeline::new(
            vec![stage.clone()],
            Arc::new(FeedbackTracker::new()),
        ));
        let task = Task::new("Add input validation to the parser", "rust");

        let first = {
            let pipeline = Arc::clone(&pipeline);
            let task = task.clone();
            tokio::spawn(async move { pipeline.run(&task).await })
        };
        stage.entered.notified().await;

        let second = pipeline.run(&task).await;
        assert!(!second.success);
        assert_eq!(second.failure_kind.as_deref(), Some("run_in_flight"));
        assert!(pipeline.is_running(&task.id));

        stage.release.notify_one();
        let first = first.await.unwrap();
        assert!(first.success);
        assert!(!pipeline.is_running(&task.id));

        stage.release.notify_one();
        assert!(pipeline.run(&task).await.success);
    }

    #[tokio::test]
    async fn test_quality_score_and_recommendation() {
        let assess = Arc::new(ScriptedStage::new(
            StageKind::Assess,
            "Solid work.\nOVERALL QUALITY SCORE: 8.5\nRECOMMENDATION: APPROVED FOR INTEGRATION",
        ));
        let pipeline = PeerReviewPipeline::new(
            vec![Arc::new(ScriptedStage::new(StageKind::Test, "tests")), assess],
            Arc::new(FeedbackTracker::new()),
        );

        let report = pipeline.run(&Task::new("t", "rust")).await;
        assert_eq!(report.quality_score, 8.5);
        assert_eq!(report.recommendation, Recommendation::Approved);
    }

    #[test]
    fn test_recommendation_marker_order() {
        assert_eq!(
            Recommendation::from_output("APPROVED FOR INTEGRATION, not REJECTED"),
            Recommendation::Approved
        );
        assert_eq!(
            Recommendation::from_output("NEEDS IMPROVEMENT"),
            Recommendation::NeedsImprovement
        );
        assert_eq!(Recommendation::from_output("meh"), Recommendation::Unknown);
        assert_eq!(extract_quality_score("no score here"), 0.0);
    }

    #[tokio::test]
    async fn test_empty_pipeline_fails() {
        let pipeline = PeerReviewPipeline::new(Vec::new(), Arc::new(FeedbackTracker::new()));
        let report = pipeline.run(&Task::new("t", "rust")).await;
        assert_eq!(report.failure_kind.as_deref(), Some("empty_pipeline"));
    }

    #[tokio::test]
    async fn test_workflow_stats_lists_agents() {
        let pipeline = PeerReviewPipeline::new(
            vec![
                Arc::new(ScriptedStage::new(StageKind::Implement, "c")),
                Arc::new(ScriptedStage::new(StageKind::Test, "t")),
            ],
            Arc::new(FeedbackTracker::new()),
        )
        .with_max_retries(3);
        let stats = pipeline.workflow_stats();
        assert_eq!(stats.workflow_agents, vec!["implement", "test"]);
        assert_eq!(stats.max_retries, 3);
        assert!(stats.recent_feedback.is_empty());
    }
}

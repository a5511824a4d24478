//! Single-task driver.
//!
//! [`OrchestrationEngine::process_task`] reads a task's status, runs the
//! matching stage operation and commits the resulting transition. Stage
//! operations run in their own tokio task under the configured timeout, so
//! errors, timeouts and panics all end with the task in `error` instead of
//! escaping to the caller.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::config::EngineConfig;
use super::operations::{StageOperations, StageOutcome};
use crate::agents::AgentError;
use crate::error::{EngineError, LifecycleError, StoreError};
use crate::metrics::MetricsCollector;
use crate::scheduler::PriorityScheduler;
use crate::store::{TaskFilter, TaskStore};
use crate::task::{LifecycleManager, Project, ProjectStatus, StageReport, Task, TaskStatus};

/// Parent links followed before a chain is treated as cyclic.
const MAX_PARENT_CHAIN: u32 = 64;

/// What a call to [`OrchestrationEngine::process_task`] did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The task moved from one status to another.
    Advanced { from: TaskStatus, to: TaskStatus },
    /// A parent is ready to integrate but some subtasks are not completed.
    Waiting,
    /// Nothing to do: unknown id, non-actionable status, unexpected status,
    /// or already in flight.
    Skipped,
    /// A stage fault moved the task to `error`.
    Faulted(String),
}

#[derive(Debug, Error)]
enum StageFailure {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{stage} failed: {source}")]
    Agent {
        stage: TaskStatus,
        #[source]
        source: AgentError,
    },

    #[error("{stage} panicked: {message}")]
    Panicked { stage: TaskStatus, message: String },
}

impl From<StoreError> for StageFailure {
    fn from(e: StoreError) -> Self {
        StageFailure::Engine(e.into())
    }
}

impl StageFailure {
    fn stage(&self) -> &'static str {
        match self {
            StageFailure::Agent { stage, .. } | StageFailure::Panicked { stage, .. } => {
                stage.as_str()
            }
            StageFailure::Engine(_) => "engine",
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            StageFailure::Engine(_) => "engine",
            StageFailure::Agent {
                source: AgentError::Timeout { .. },
                ..
            } => "timeout",
            StageFailure::Agent { .. } => "agent",
            StageFailure::Panicked { .. } => "panic",
        }
    }
}

/// Removes a task id from the in-flight set when processing ends.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    task_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.task_id);
        }
    }
}

/// Where a parent's subtasks stand when it is ready to integrate.
#[derive(Debug, Clone, PartialEq)]
enum SubtaskProgress {
    Completed,
    /// `floor` is the lowest priority any unfinished subtask is queued at.
    Pending { floor: f64 },
    Failed(String),
}

/// Which payload a finished stage records on the task.
#[derive(Debug, Clone, Copy)]
enum Payload {
    Code,
    TestReport,
    QualityReport,
    IntegrationReport,
}

impl Payload {
    fn apply(self, task: &mut Task, outcome: &StageOutcome) {
        match self {
            Payload::Code => {
                if outcome.passed {
                    task.code = outcome.artifacts.clone();
                }
            }
            Payload::TestReport => {
                task.test_results = Some(StageReport::new(outcome.passed, outcome.content.clone()))
            }
            Payload::QualityReport => {
                task.quality_results =
                    Some(StageReport::new(outcome.passed, outcome.content.clone()))
            }
            Payload::IntegrationReport => {
                task.integration_results =
                    Some(StageReport::new(outcome.passed, outcome.content.clone()))
            }
        }
    }
}

/// One work stage: the status it runs in, where it goes on success, and
/// the messages recorded along the way.
struct Step {
    working: TaskStatus,
    passed: TaskStatus,
    start_message: &'static str,
    pass_message: &'static str,
    fail_message: &'static str,
    payload: Payload,
}

const IMPLEMENT_STEP: Step = Step {
    working: TaskStatus::Implementing,
    passed: TaskStatus::ReadyForTesting,
    start_message: "Starting implementation",
    pass_message: "Implementation completed",
    fail_message: "Implementation failed",
    payload: Payload::Code,
};

const TEST_STEP: Step = Step {
    working: TaskStatus::Testing,
    passed: TaskStatus::ReadyForQuality,
    start_message: "Starting tests",
    pass_message: "Tests passed",
    fail_message: "Tests failed",
    payload: Payload::TestReport,
};

const QUALITY_STEP: Step = Step {
    working: TaskStatus::QualityCheck,
    passed: TaskStatus::ReadyForIntegration,
    start_message: "Starting quality assessment",
    pass_message: "Quality check passed",
    fail_message: "Quality check failed",
    payload: Payload::QualityReport,
};

const INTEGRATE_STEP: Step = Step {
    working: TaskStatus::Integrating,
    passed: TaskStatus::Completed,
    start_message: "Starting integration",
    pass_message: "Integration successful",
    fail_message: "Integration failed",
    payload: Payload::IntegrationReport,
};

/// Drives tasks through the lifecycle, one stage per call.
pub struct OrchestrationEngine {
    config: EngineConfig,
    store: Arc<TaskStore>,
    scheduler: PriorityScheduler,
    lifecycle: LifecycleManager,
    operations: Arc<dyn StageOperations>,
    in_flight: Mutex<HashSet<String>>,
    metrics: MetricsCollector,
}

impl OrchestrationEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<TaskStore>,
        operations: Arc<dyn StageOperations>,
    ) -> Self {
        Self {
            config,
            scheduler: PriorityScheduler::new(Arc::clone(&store)),
            store,
            lifecycle: LifecycleManager::new(),
            operations,
            in_flight: Mutex::new(HashSet::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>, EngineError> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, EngineError> {
        Ok(self.store.get_project(project_id).await?)
    }

    pub async fn create_project(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Project, EngineError> {
        let project = Project::new(name, description);
        self.store.insert_project(project.clone()).await?;
        info!(project_id = %project.id, name = %project.name, "Created project");
        Ok(project)
    }

    /// Store a new task and link it to its project and parent.
    ///
    /// # Errors
    /// `ProjectNotFound` / `ParentNotFound` if a referenced record is missing;
    /// nothing is stored in that case.
    pub async fn create_task(&self, task: Task) -> Result<Task, EngineError> {
        if let Some(project_id) = &task.project_id {
            if self.store.get_project(project_id).await?.is_none() {
                return Err(EngineError::ProjectNotFound(project_id.clone()));
            }
        }
        if let Some(parent_id) = &task.parent_task_id {
            if self.store.get(parent_id).await?.is_none() {
                return Err(EngineError::ParentNotFound(parent_id.clone()));
            }
        }

        self.store.insert(task.clone()).await?;

        if let Some(parent_id) = &task.parent_task_id {
            let task_id = task.id.clone();
            self.store
                .update(parent_id, |parent| {
                    if !parent.subtask_ids.contains(&task_id) {
                        parent.subtask_ids.push(task_id);
                    }
                    Ok::<_, StoreError>(())
                })
                .await?;
        }
        if let Some(project_id) = &task.project_id {
            let is_root = task.parent_task_id.is_none();
            self.store
                .update_project(project_id, |project| project.add_task(&task.id, is_root))
                .await?;
        }

        info!(
            task_id = %task.id,
            project_id = ?task.project_id,
            parent_task_id = ?task.parent_task_id,
            priority = task.priority(),
            "Created task"
        );
        Ok(task)
    }

    /// Create a task and queue it for processing.
    pub async fn submit_task(&self, task: Task) -> Result<Task, EngineError> {
        let task = self.create_task(task).await?;
        self.scheduler.enqueue(&task);
        Ok(task)
    }

    /// Delete a task and unlink it from the queue, its parent and its project.
    ///
    /// The task's history is discarded with it. Returns false if it did not
    /// exist.
    pub async fn delete_task(&self, task_id: &str) -> Result<bool, EngineError> {
        let Some(task) = self.store.remove(task_id).await? else {
            return Ok(false);
        };
        self.scheduler.remove(task_id);

        if let Some(parent_id) = &task.parent_task_id {
            self.store
                .update(parent_id, |parent| {
                    parent.subtask_ids.retain(|id| id != task_id);
                    Ok::<_, StoreError>(())
                })
                .await?;
        }
        if let Some(project_id) = &task.project_id {
            self.store
                .update_project(project_id, |project| project.remove_task(task_id))
                .await?;
        }

        info!(task_id, "Deleted task");
        Ok(true)
    }

    /// Warm the cache from the store and queue every actionable task.
    ///
    /// Returns the number of tasks queued.
    pub async fn load_pending(&self) -> Result<usize, EngineError> {
        let projects = self.store.list_projects().await?;
        let tasks = self.store.warm(&TaskFilter::pending()).await?;

        let mut queued = 0;
        for task in tasks.iter().filter(|t| t.status().is_actionable()) {
            if self.scheduler.enqueue(task) {
                queued += 1;
            }
        }
        info!(
            projects = projects.len(),
            loaded = tasks.len(),
            queued,
            "Loaded pending tasks"
        );
        Ok(queued)
    }

    pub async fn update_priority(
        &self,
        task_id: &str,
        priority: f64,
        reason: Option<&str>,
    ) -> Result<f64, EngineError> {
        let updated = self
            .store
            .update(task_id, |task| {
                task.update_priority(priority, reason);
                Ok::<_, EngineError>(task.priority())
            })
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        self.scheduler.reprioritize(task_id, updated);
        Ok(updated)
    }

    /// Apply several priority updates; unknown ids are skipped.
    ///
    /// Returns the number of tasks updated.
    pub async fn update_task_priorities(
        &self,
        priorities: &[(String, f64)],
    ) -> Result<usize, EngineError> {
        let mut updated = 0;
        for (task_id, priority) in priorities {
            match self.update_priority(task_id, *priority, None).await {
                Ok(_) => updated += 1,
                Err(EngineError::TaskNotFound(_)) => {
                    warn!(task_id = %task_id, "Skipping priority update for unknown task")
                }
                Err(e) => return Err(e),
            }
        }
        Ok(updated)
    }

    pub async fn rebalance_priorities(
        &self,
        task_ids: Option<&[String]>,
    ) -> Result<usize, EngineError> {
        Ok(self.scheduler.rebalance(task_ids).await?)
    }

    /// Cached tasks in `status`, highest priority first.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let mut tasks = self.store.cached(&TaskFilter::all().with_status(status));
        tasks.sort_by(|a, b| b.priority().total_cmp(&a.priority()));
        tasks
    }

    /// Recompute a project's status from its root tasks.
    pub async fn refresh_project_status(
        &self,
        project_id: &str,
    ) -> Result<ProjectStatus, EngineError> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| EngineError::ProjectNotFound(project_id.to_string()))?;

        let mut statuses = Vec::with_capacity(project.root_task_ids.len());
        for task_id in &project.root_task_ids {
            if let Some(task) = self.store.get(task_id).await? {
                statuses.push(task.status());
            }
        }

        let (changed, status) = self
            .store
            .update_project(project_id, |project| {
                (project.refresh_status(statuses), project.status)
            })
            .await?
            .ok_or_else(|| EngineError::ProjectNotFound(project_id.to_string()))?;
        if changed {
            info!(project_id, status = status.as_str(), "Project status updated");
        }
        Ok(status)
    }

    /// Move a task out of `needs_revision` or `error` back to its resume
    /// point and queue it.
    pub async fn reopen(&self, task_id: &str) -> Result<TaskStatus, EngineError> {
        let task = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;
        let target = self.lifecycle.resume_point(&task).ok_or_else(|| {
            LifecycleError::InvalidTransition {
                from: task.status(),
                to: TaskStatus::ReadyForImplementation,
            }
        })?;

        let reopened = self
            .commit(task_id, target, &format!("Reopened at {}", target))
            .await?;
        self.scheduler.enqueue(&reopened);
        Ok(target)
    }

    /// Give up on a task in `needs_revision` or `error`.
    pub async fn abandon(&self, task_id: &str, reason: &str) -> Result<(), EngineError> {
        let message = if reason.is_empty() {
            "Abandoned".to_string()
        } else {
            format!("Abandoned: {}", reason)
        };
        self.commit(task_id, TaskStatus::Failed, &message).await?;
        self.scheduler.remove(task_id);
        Ok(())
    }

    /// Dequeue the next task and process it.
    pub async fn process_next(&self) -> Option<(String, ProcessOutcome)> {
        let task_id = self.scheduler.next()?;
        let outcome = self.process_task(&task_id).await;
        Some((task_id, outcome))
    }

    /// Advance `task_id` by one stage.
    pub async fn process_task(&self, task_id: &str) -> ProcessOutcome {
        self.process(task_id, None).await
    }

    /// Advance `task_id` only if it is still in `expected`.
    ///
    /// Redelivered work for a task that has already moved on is a no-op.
    pub async fn process_task_expecting(
        &self,
        task_id: &str,
        expected: TaskStatus,
    ) -> ProcessOutcome {
        self.process(task_id, Some(expected)).await
    }

    fn claim(&self, task_id: &str) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().expect("in_flight lock poisoned");
        if !set.insert(task_id.to_string()) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            task_id: task_id.to_string(),
        })
    }

    async fn process(&self, task_id: &str, expected: Option<TaskStatus>) -> ProcessOutcome {
        let Some(_claim) = self.claim(task_id) else {
            debug!(task_id, "Task already in flight");
            return ProcessOutcome::Skipped;
        };

        let task = match self.store.get(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                warn!(task_id, "Task not found");
                return ProcessOutcome::Skipped;
            }
            Err(e) => {
                error!(task_id, error = %e, "Failed to load task");
                return ProcessOutcome::Faulted(e.to_string());
            }
        };

        let status = task.status();
        if expected.is_some_and(|expected| expected != status) {
            debug!(task_id, status = status.as_str(), "Task already moved on");
            return ProcessOutcome::Skipped;
        }
        if !status.is_actionable() {
            debug!(task_id, status = status.as_str(), "Task is not actionable");
            return ProcessOutcome::Skipped;
        }

        info!(task_id, status = status.as_str(), "Processing task");

        let outcome = match self.advance(&task).await {
            Ok(outcome) => outcome,
            Err(failure) => {
                let reason = failure.to_string();
                error!(task_id, stage = failure.stage(), error = %reason, "Stage fault");
                self.metrics.record_fault(failure.stage(), failure.kind());
                self.mark_error(task_id, &reason).await;
                ProcessOutcome::Faulted(reason)
            }
        };

        if let ProcessOutcome::Advanced { to, .. } = &outcome {
            if to.is_actionable() {
                if let Some(task) = self.store.snapshot(task_id) {
                    self.scheduler.enqueue(&task);
                }
            }
        }

        if task.parent_task_id.is_none() {
            if let Some(project_id) = &task.project_id {
                if let Err(e) = self.refresh_project_status(project_id).await {
                    warn!(task_id, project_id = %project_id, error = %e, "Failed to refresh project status");
                }
            }
        }

        outcome
    }

    async fn advance(&self, task: &Task) -> Result<ProcessOutcome, StageFailure> {
        match task.status() {
            TaskStatus::Created => self.decompose(task).await,
            TaskStatus::ReadyForImplementation => self.run_step(task, &IMPLEMENT_STEP).await,
            TaskStatus::ReadyForTesting => self.run_step(task, &TEST_STEP).await,
            TaskStatus::ReadyForQuality => self.run_step(task, &QUALITY_STEP).await,
            TaskStatus::ReadyForIntegration => match self.subtask_progress(task).await? {
                SubtaskProgress::Completed => self.run_step(task, &INTEGRATE_STEP).await,
                SubtaskProgress::Pending { floor } => {
                    // Requeued behind every unfinished subtask so the next
                    // poll comes after they have had a turn.
                    let priority = task.priority().min(floor);
                    info!(task_id = %task.id, priority, "Waiting for subtasks to complete");
                    self.scheduler.enqueue_id(&task.id, priority);
                    Ok(ProcessOutcome::Waiting)
                }
                SubtaskProgress::Failed(subtask_id) => {
                    let (from, to) = (task.status(), TaskStatus::NeedsRevision);
                    warn!(task_id = %task.id, subtask_id = %subtask_id, "Subtask failed");
                    self.commit(&task.id, to, &format!("Subtask {} failed", subtask_id))
                        .await?;
                    Ok(ProcessOutcome::Advanced { from, to })
                }
            },
            _ => Ok(ProcessOutcome::Skipped),
        }
    }

    async fn decompose(&self, task: &Task) -> Result<ProcessOutcome, StageFailure> {
        let from = task.status();
        let depth = self.depth_of(task).await?;
        if depth >= self.config.max_decomposition_depth {
            let to = TaskStatus::ReadyForImplementation;
            self.commit(
                &task.id,
                to,
                &format!("Decomposition skipped at depth {}", depth),
            )
            .await?;
            return Ok(ProcessOutcome::Advanced { from, to });
        }

        let working = self
            .commit(&task.id, TaskStatus::Decomposing, "Starting task decomposition")
            .await?;
        let operations = Arc::clone(&self.operations);
        let descriptions = self
            .guarded(TaskStatus::Decomposing, async move {
                operations.decompose(&working).await
            })
            .await?;

        // Subtasks left behind by an interrupted earlier pass are reused.
        let mut existing = HashSet::new();
        for subtask_id in &task.subtask_ids {
            if let Some(subtask) = self.store.get(subtask_id).await? {
                existing.insert(subtask.description);
            }
        }

        let mut created = Vec::new();
        for description in descriptions.iter().filter(|d| !existing.contains(*d)) {
            let mut subtask = Task::new(description.as_str(), task.language.as_str())
                .with_priority(task.priority())
                .with_parent(task.id.as_str());
            if let Some(project_id) = &task.project_id {
                subtask = subtask.with_project(project_id.as_str());
            }
            let subtask_id = subtask.id.clone();
            match self.create_task(subtask).await {
                Ok(subtask) => created.push(subtask),
                Err(e) => {
                    let mut partial: Vec<String> = created.into_iter().map(|t| t.id).collect();
                    partial.push(subtask_id);
                    self.discard_subtasks(&task.id, &partial).await;
                    return Err(e.into());
                }
            }
        }
        for subtask in &created {
            self.scheduler.enqueue(subtask);
        }

        let message = if descriptions.is_empty() {
            "No decomposition needed".to_string()
        } else {
            format!("Created {} subtasks", created.len())
        };
        let to = TaskStatus::ReadyForImplementation;
        self.commit(&task.id, to, &message).await?;
        Ok(ProcessOutcome::Advanced { from, to })
    }

    async fn run_step(&self, task: &Task, step: &Step) -> Result<ProcessOutcome, StageFailure> {
        let from = task.status();
        let working = self.commit(&task.id, step.working, step.start_message).await?;

        let operations = Arc::clone(&self.operations);
        let stage = step.working;
        let outcome = self
            .guarded(stage, async move {
                match stage {
                    TaskStatus::Implementing => operations.implement(&working).await,
                    TaskStatus::Testing => operations.test(&working).await,
                    TaskStatus::QualityCheck => operations.assess(&working).await,
                    _ => operations.integrate(&working).await,
                }
            })
            .await?;

        let (to, message) = if outcome.passed {
            (step.passed, step.pass_message)
        } else {
            (TaskStatus::NeedsRevision, step.fail_message)
        };
        let payload = step.payload;
        self.commit_with(&task.id, to, message, |t| payload.apply(t, &outcome))
            .await?;
        Ok(ProcessOutcome::Advanced { from, to })
    }

    /// Run a stage operation in its own task under the stage timeout.
    async fn guarded<T, F>(&self, stage: TaskStatus, operation: F) -> Result<T, StageFailure>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, AgentError>> + Send + 'static,
    {
        let started = std::time::Instant::now();
        let mut handle = tokio::spawn(operation);
        let result = match tokio::time::timeout(self.config.stage_timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(source))) => Err(StageFailure::Agent { stage, source }),
            Ok(Err(join_error)) => Err(StageFailure::Panicked {
                stage,
                message: join_error.to_string(),
            }),
            Err(_) => {
                handle.abort();
                Err(StageFailure::Agent {
                    stage,
                    source: AgentError::Timeout {
                        seconds: self.config.stage_timeout.as_secs(),
                    },
                })
            }
        };
        self.metrics
            .record_stage_duration(stage.as_str(), started.elapsed().as_secs_f64());
        result
    }

    async fn commit(
        &self,
        task_id: &str,
        to: TaskStatus,
        message: &str,
    ) -> Result<Task, EngineError> {
        self.commit_with(task_id, to, message, |_| {}).await
    }

    /// Apply `record` and the transition to `to` as one store update.
    async fn commit_with<F>(
        &self,
        task_id: &str,
        to: TaskStatus,
        message: &str,
        record: F,
    ) -> Result<Task, EngineError>
    where
        F: FnOnce(&mut Task) + Send,
    {
        let (from, task) = self
            .store
            .update(task_id, |task| {
                let from = task.status();
                record(task);
                self.lifecycle.transition(task, to, message)?;
                Ok::<_, EngineError>((from, task.clone()))
            })
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))?;

        self.metrics.record_transition(from.as_str(), to.as_str());
        info!(
            task_id,
            from = from.as_str(),
            to = to.as_str(),
            reason = message,
            "Task transitioned"
        );
        Ok(task)
    }

    async fn mark_error(&self, task_id: &str, reason: &str) {
        let message = format!("Error: {}", reason);
        if let Err(e) = self.commit(task_id, TaskStatus::Error, &message).await {
            error!(task_id, error = %e, "Failed to record task error");
        }
    }

    /// Roll back the subtasks of a decomposition pass that did not finish.
    async fn discard_subtasks(&self, parent_id: &str, subtask_ids: &[String]) {
        for subtask_id in subtask_ids {
            if let Err(e) = self.delete_task(subtask_id).await {
                warn!(
                    task_id = parent_id,
                    subtask_id = %subtask_id,
                    error = %e,
                    "Failed to roll back subtask"
                );
            }
        }
        info!(task_id = parent_id, discarded = subtask_ids.len(), "Rolled back partial decomposition");
    }

    fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight
            .lock()
            .expect("in_flight lock poisoned")
            .contains(task_id)
    }

    /// Check a parent's subtasks, queueing any actionable one that fell off
    /// the queue. A missing subtask counts as unfinished.
    async fn subtask_progress(&self, task: &Task) -> Result<SubtaskProgress, StageFailure> {
        let mut floor: Option<f64> = None;
        for subtask_id in &task.subtask_ids {
            let priority = match self.store.get(subtask_id).await? {
                Some(subtask) => match subtask.status() {
                    TaskStatus::Completed => continue,
                    TaskStatus::Failed => return Ok(SubtaskProgress::Failed(subtask.id)),
                    status => {
                        if status.is_actionable() && !self.is_in_flight(&subtask.id) {
                            self.scheduler.ensure_queued(&subtask);
                        }
                        self.scheduler
                            .queue()
                            .queued_priority(&subtask.id)
                            .unwrap_or_else(|| subtask.priority())
                    }
                },
                None => {
                    warn!(task_id = %task.id, subtask_id = %subtask_id, "Subtask missing");
                    task.priority()
                }
            };
            floor = Some(floor.map_or(priority, |floor| floor.min(priority)));
        }
        Ok(match floor {
            Some(floor) => SubtaskProgress::Pending { floor },
            None => SubtaskProgress::Completed,
        })
    }

    /// Number of ancestors above `task`.
    async fn depth_of(&self, task: &Task) -> Result<u32, StoreError> {
        let mut depth = 0;
        let mut parent_id = task.parent_task_id.clone();
        while let Some(id) = parent_id {
            if depth >= MAX_PARENT_CHAIN {
                warn!(task_id = %task.id, "Parent chain too long; treating as maximum depth");
                break;
            }
            depth += 1;
            parent_id = self
                .store
                .get(&id)
                .await?
                .and_then(|parent| parent.parent_task_id);
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::operations::StageOutcome;
    use crate::store::{MemoryStore, PersistenceStore};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Passes every stage; decomposes into the configured subtasks.
    #[derive(Default)]
    struct PassingOps {
        subtasks: Vec<String>,
    }

    #[async_trait]
    impl StageOperations for PassingOps {
        async fn decompose(&self, _task: &Task) -> Result<Vec<String>, AgentError> {
            Ok(self.subtasks.clone())
        }

        async fn implement(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            let mut outcome = StageOutcome::passed("code");
            outcome.artifacts.files.push(crate::task::CodeFile {
                path: "src/lib.rs".to_string(),
                content: "pub fn f() {}".to_string(),
            });
            Ok(outcome)
        }

        async fn test(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::passed("tests pass"))
        }

        async fn assess(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::passed("OVERALL QUALITY SCORE: 9"))
        }

        async fn integrate(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::passed("INTEGRATION READY"))
        }
    }

    struct SlowOps;

    #[async_trait]
    impl StageOperations for SlowOps {
        async fn decompose(&self, _task: &Task) -> Result<Vec<String>, AgentError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn implement(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            panic!("implementation exploded");
        }

        async fn test(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Err(AgentError::EmptyOutput("test".to_string()))
        }

        async fn assess(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::failed("no"))
        }

        async fn integrate(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::failed("no"))
        }
    }

    /// Refuses to save tasks with one description while armed.
    struct FlakyStore {
        inner: MemoryStore,
        poisoned: String,
        armed: AtomicBool,
    }

    impl FlakyStore {
        fn new(poisoned: &str) -> Self {
            Self {
                inner: MemoryStore::new(),
                poisoned: poisoned.to_string(),
                armed: AtomicBool::new(true),
            }
        }
    }

    #[async_trait]
    impl PersistenceStore for FlakyStore {
        async fn load(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
            self.inner.load(task_id).await
        }

        async fn save(&self, task: &Task) -> Result<(), StoreError> {
            if self.armed.load(Ordering::SeqCst) && task.description == self.poisoned {
                return Err(StoreError::Io {
                    path: task.id.clone(),
                    source: std::io::Error::other("disk full"),
                });
            }
            self.inner.save(task).await
        }

        async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
            self.inner.list(filter).await
        }

        async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
            self.inner.delete(task_id).await
        }

        async fn load_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
            self.inner.load_project(project_id).await
        }

        async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
            self.inner.save_project(project).await
        }

        async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
            self.inner.list_projects().await
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig::default()
            .with_stage_timeout(Duration::from_millis(100))
            .with_max_decomposition_depth(1)
    }

    fn engine_with(ops: Arc<dyn StageOperations>) -> OrchestrationEngine {
        let store = Arc::new(TaskStore::new(Arc::new(MemoryStore::new())));
        OrchestrationEngine::new(test_config(), store, ops)
    }

    fn compiler_ops() -> Arc<dyn StageOperations> {
        Arc::new(PassingOps {
            subtasks: vec!["lexer".to_string(), "parser".to_string()],
        })
    }

    async fn drain(engine: &OrchestrationEngine) -> Vec<ProcessOutcome> {
        let mut outcomes = Vec::new();
        while let Some((_, outcome)) = engine.process_next().await {
            outcomes.push(outcome);
            assert!(outcomes.len() < 100, "engine did not settle");
        }
        outcomes
    }

    #[tokio::test]
    async fn test_single_task_runs_to_completion() {
        let engine = engine_with(Arc::new(PassingOps::default()));
        let task = engine.submit_task(Task::new("Build a lexer", "rust")).await.unwrap();

        drain(&engine).await;

        let done = engine.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status(), TaskStatus::Completed);
        assert_eq!(done.code.files.len(), 1);
        assert!(done.integration_results.as_ref().unwrap().passed);
        let statuses: Vec<_> = done.status_history().map(|e| e.status).collect();
        assert_eq!(statuses.first(), Some(&TaskStatus::Decomposing));
        assert_eq!(statuses.len(), 10);
    }

    #[tokio::test]
    async fn test_parent_waits_for_subtasks() {
        let engine = engine_with(Arc::new(PassingOps {
            subtasks: vec!["lexer".to_string(), "parser".to_string()],
        }));
        let project = engine.create_project("compiler", "toy compiler").await.unwrap();
        let parent = engine
            .submit_task(Task::new("Build a compiler", "rust").with_project(project.id.as_str()))
            .await
            .unwrap();

        let outcomes = drain(&engine).await;
        assert!(outcomes.contains(&ProcessOutcome::Waiting));

        let parent = engine.get_task(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent.subtask_ids.len(), 2);
        assert_eq!(parent.status(), TaskStatus::Completed);
        for id in &parent.subtask_ids {
            let sub = engine.get_task(id).await.unwrap().unwrap();
            assert_eq!(sub.status(), TaskStatus::Completed);
            assert_eq!(sub.project_id.as_deref(), Some(project.id.as_str()));
        }

        let project = engine.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Completed);
        assert_eq!(project.root_task_ids, vec![parent.id.clone()]);
        assert_eq!(project.all_task_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_waiting_parent_is_requeued_behind_subtasks() {
        let engine = engine_with(compiler_ops());
        let parent = engine
            .submit_task(Task::new("Build a compiler", "rust").with_priority(40.0))
            .await
            .unwrap();
        engine.process_next().await;
        engine.update_priority(&parent.id, 90.0, None).await.unwrap();

        // Implement, test and assess at 90, then the first integration poll.
        for _ in 0..4 {
            let (id, _) = engine.process_next().await.unwrap();
            assert_eq!(id, parent.id);
        }
        assert_eq!(engine.scheduler().queue().queued_priority(&parent.id), Some(40.0));

        let (next, _) = engine.process_next().await.unwrap();
        assert_ne!(next, parent.id);
    }

    #[tokio::test]
    async fn test_failed_subtask_sends_parent_to_revision() {
        let engine = engine_with(compiler_ops());
        let parent = engine.submit_task(Task::new("Build a compiler", "rust")).await.unwrap();
        engine.process_next().await;

        let parent_task = engine.get_task(&parent.id).await.unwrap().unwrap();
        let lexer = parent_task.subtask_ids[0].clone();
        engine
            .store()
            .update(&lexer, |t| {
                t.update_status(TaskStatus::Failed, "abandoned");
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        engine.scheduler().remove(&lexer);

        drain(&engine).await;

        let parent = engine.get_task(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status(), TaskStatus::NeedsRevision);
        let last = parent.status_history().last().unwrap();
        assert!(last.message.contains(&lexer));
        assert!(!engine.scheduler().queue().contains(&parent.id));
    }

    #[tokio::test]
    async fn test_failed_decomposition_rolls_back_subtasks() {
        let backend = Arc::new(FlakyStore::new("parser"));
        let store = Arc::new(TaskStore::new(backend.clone()));
        let engine = OrchestrationEngine::new(test_config(), store, compiler_ops());
        let parent = engine.submit_task(Task::new("Build a compiler", "rust")).await.unwrap();

        let (_, outcome) = engine.process_next().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Faulted(_)));
        let faulted = engine.get_task(&parent.id).await.unwrap().unwrap();
        assert_eq!(faulted.status(), TaskStatus::Error);
        assert!(faulted.subtask_ids.is_empty());
        assert_eq!(engine.store().len(), 1);

        backend.armed.store(false, Ordering::SeqCst);
        assert_eq!(engine.reopen(&parent.id).await.unwrap(), TaskStatus::Created);
        drain(&engine).await;

        let parent = engine.get_task(&parent.id).await.unwrap().unwrap();
        assert_eq!(parent.status(), TaskStatus::Completed);
        assert_eq!(parent.subtask_ids.len(), 2);
        assert_eq!(engine.store().len(), 3);
    }

    #[tokio::test]
    async fn test_timeout_panic_and_error_become_error_status() {
        let engine = engine_with(Arc::new(SlowOps));

        let slow = engine.create_task(Task::new("slow", "rust")).await.unwrap();
        let outcome = engine.process_task(&slow.id).await;
        assert!(matches!(outcome, ProcessOutcome::Faulted(ref r) if r.contains("timed out")));
        assert_eq!(
            engine.get_task(&slow.id).await.unwrap().unwrap().status(),
            TaskStatus::Error
        );

        let boom = engine.create_task(Task::new("boom", "rust")).await.unwrap();
        engine
            .store()
            .update(&boom.id, |t| {
                t.update_status(TaskStatus::ReadyForImplementation, "");
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        let outcome = engine.process_task(&boom.id).await;
        assert!(matches!(outcome, ProcessOutcome::Faulted(ref r) if r.contains("panicked")));
        assert_eq!(
            engine.get_task(&boom.id).await.unwrap().unwrap().status(),
            TaskStatus::Error
        );
    }

    #[tokio::test]
    async fn test_reopen_resumes_at_checkpoint() {
        let engine = engine_with(Arc::new(SlowOps));
        let task = engine.create_task(Task::new("t", "rust")).await.unwrap();
        engine
            .store()
            .update(&task.id, |t| {
                t.update_status(TaskStatus::ReadyForTesting, "");
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();

        engine.process_task(&task.id).await;
        assert_eq!(
            engine.get_task(&task.id).await.unwrap().unwrap().status(),
            TaskStatus::Error
        );

        let resumed = engine.reopen(&task.id).await.unwrap();
        assert_eq!(resumed, TaskStatus::ReadyForTesting);
        assert!(engine.scheduler().queue().contains(&task.id));
    }

    #[tokio::test]
    async fn test_abandon_only_from_parked_states() {
        let engine = engine_with(Arc::new(PassingOps::default()));
        let task = engine.create_task(Task::new("t", "rust")).await.unwrap();

        let err = engine.abandon(&task.id, "no longer needed").await.unwrap_err();
        assert!(matches!(err, EngineError::Lifecycle(_)));

        engine
            .store()
            .update(&task.id, |t| {
                t.update_status(TaskStatus::NeedsRevision, "");
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        engine.abandon(&task.id, "no longer needed").await.unwrap();
        assert_eq!(
            engine.get_task(&task.id).await.unwrap().unwrap().status(),
            TaskStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_expected_status_mismatch_is_noop() {
        let engine = engine_with(Arc::new(PassingOps::default()));
        let task = engine.create_task(Task::new("t", "rust")).await.unwrap();

        let outcome = engine
            .process_task_expecting(&task.id, TaskStatus::ReadyForTesting)
            .await;
        assert_eq!(outcome, ProcessOutcome::Skipped);
        assert!(engine.get_task(&task.id).await.unwrap().unwrap().history().is_empty());
    }

    #[tokio::test]
    async fn test_create_task_validates_links() {
        let engine = engine_with(Arc::new(PassingOps::default()));
        let err = engine
            .create_task(Task::new("t", "rust").with_project("PROJ-missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ProjectNotFound(_)));

        let err = engine
            .create_task(Task::new("t", "rust").with_parent("TASK-missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ParentNotFound(_)));
        assert!(engine.store().is_empty());
    }

    #[tokio::test]
    async fn test_delete_unlinks_everywhere() {
        let engine = engine_with(Arc::new(PassingOps::default()));
        let project = engine.create_project("p", "").await.unwrap();
        let parent = engine
            .create_task(Task::new("parent", "rust").with_project(project.id.as_str()))
            .await
            .unwrap();
        let child = engine
            .submit_task(
                Task::new("child", "rust")
                    .with_project(project.id.as_str())
                    .with_parent(parent.id.as_str()),
            )
            .await
            .unwrap();

        assert!(engine.delete_task(&child.id).await.unwrap());
        assert!(!engine.delete_task(&child.id).await.unwrap());
        assert!(!engine.scheduler().queue().contains(&child.id));
        let parent = engine.get_task(&parent.id).await.unwrap().unwrap();
        assert!(parent.subtask_ids.is_empty());
        let project = engine.get_project(&project.id).await.unwrap().unwrap();
        assert_eq!(project.all_task_ids, vec![parent.id.clone()]);
    }

    #[tokio::test]
    async fn test_priority_updates_and_listing() {
        let engine = engine_with(Arc::new(PassingOps::default()));
        let a = engine.submit_task(Task::new("a", "rust")).await.unwrap();
        let b = engine.submit_task(Task::new("b", "rust")).await.unwrap();

        assert_eq!(engine.update_priority(&b.id, 180.0, None).await.unwrap(), 100.0);
        assert_eq!(engine.scheduler().queue().queued_priority(&b.id), Some(100.0));

        let updated = engine
            .update_task_priorities(&[(a.id.clone(), 70.0), ("TASK-nope".to_string(), 1.0)])
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let listed: Vec<_> = engine
            .tasks_by_status(TaskStatus::Created)
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(listed, vec![b.id.clone(), a.id.clone()]);
    }
}

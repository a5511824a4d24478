//! Core task types: status, history and per-stage payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Priority assigned to tasks that do not specify one.
pub const DEFAULT_PRIORITY: f64 = 50.0;

/// Lowest allowed priority.
pub const MIN_PRIORITY: f64 = 0.0;

/// Highest allowed priority.
pub const MAX_PRIORITY: f64 = 100.0;

/// Clamp a priority into `[0, 100]`. NaN falls back to the default priority.
pub fn clamp_priority(priority: f64) -> f64 {
    if priority.is_nan() {
        DEFAULT_PRIORITY
    } else {
        priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Decomposing,
    ReadyForImplementation,
    Implementing,
    ReadyForTesting,
    Testing,
    ReadyForQuality,
    QualityCheck,
    ReadyForIntegration,
    Integrating,
    Completed,
    Failed,
    Error,
    NeedsRevision,
}

impl TaskStatus {
    /// All statuses in pipeline order.
    pub const ALL: [TaskStatus; 14] = [
        TaskStatus::Created,
        TaskStatus::Decomposing,
        TaskStatus::ReadyForImplementation,
        TaskStatus::Implementing,
        TaskStatus::ReadyForTesting,
        TaskStatus::Testing,
        TaskStatus::ReadyForQuality,
        TaskStatus::QualityCheck,
        TaskStatus::ReadyForIntegration,
        TaskStatus::Integrating,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Error,
        TaskStatus::NeedsRevision,
    ];

    /// Returns the string representation used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Created => "created",
            TaskStatus::Decomposing => "decomposing",
            TaskStatus::ReadyForImplementation => "ready_for_implementation",
            TaskStatus::Implementing => "implementing",
            TaskStatus::ReadyForTesting => "ready_for_testing",
            TaskStatus::Testing => "testing",
            TaskStatus::ReadyForQuality => "ready_for_quality",
            TaskStatus::QualityCheck => "quality_check",
            TaskStatus::ReadyForIntegration => "ready_for_integration",
            TaskStatus::Integrating => "integrating",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Error => "error",
            TaskStatus::NeedsRevision => "needs_revision",
        }
    }

    /// COMPLETED and FAILED accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Checkpoints a task can be resumed from after a fault.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            TaskStatus::Created
                | TaskStatus::ReadyForImplementation
                | TaskStatus::ReadyForTesting
                | TaskStatus::ReadyForQuality
                | TaskStatus::ReadyForIntegration
        )
    }

    /// Statuses that wait for an external decision before being processed again.
    pub fn is_parked(&self) -> bool {
        matches!(self, TaskStatus::NeedsRevision | TaskStatus::Error)
    }

    /// Whether the engine has a stage operation for this status.
    pub fn is_actionable(&self) -> bool {
        self.is_resumable()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        TaskStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown task status: {}", s))
    }
}

/// What kind of mutation a history entry records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryChange {
    StatusChange,
    PriorityChange {
        old_priority: f64,
        new_priority: f64,
    },
    RelationshipAdded {
        related_task: String,
        relationship_type: String,
    },
}

/// A single append-only audit record on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// Status of the task once the change was applied.
    pub status: TaskStatus,
    #[serde(flatten)]
    pub change: HistoryChange,
    pub message: String,
}

/// A generated source or test file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFile {
    pub path: String,
    pub content: String,
}

/// Code produced by the implementation stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeArtifacts {
    pub files: Vec<CodeFile>,
    pub tests: Vec<CodeFile>,
}

impl CodeArtifacts {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty() && self.tests.is_empty()
    }

    /// Concatenated view of all files, used as input to downstream stages.
    pub fn render(&self) -> String {
        self.files
            .iter()
            .chain(self.tests.iter())
            .map(|file| format!("// {}\n{}", file.path, file.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Result payload of the testing, quality or integration stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub passed: bool,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

impl StageReport {
    pub fn new(passed: bool, content: impl Into<String>) -> Self {
        Self {
            passed,
            content: content.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// A unit of development work.
///
/// Priority and status are only mutable through [`Task::update_priority`] and
/// the lifecycle manager, each of which appends exactly one history entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub language: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    priority: f64,
    status: TaskStatus,
    pub created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    history: Vec<HistoryEntry>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub subtask_ids: Vec<String>,
    #[serde(default)]
    related_task_ids: Vec<String>,
    #[serde(default)]
    pub code: CodeArtifacts,
    #[serde(default)]
    pub test_results: Option<StageReport>,
    #[serde(default)]
    pub quality_results: Option<StageReport>,
    #[serde(default)]
    pub integration_results: Option<StageReport>,
}

impl Task {
    /// Create a new task in the `created` state with the default priority.
    pub fn new(description: impl Into<String>, language: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Self::generate_id(),
            description: description.into(),
            language: language.into(),
            requirements: Vec::new(),
            priority: DEFAULT_PRIORITY,
            status: TaskStatus::Created,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
            project_id: None,
            parent_task_id: None,
            subtask_ids: Vec::new(),
            related_task_ids: Vec::new(),
            code: CodeArtifacts::default(),
            test_results: None,
            quality_results: None,
            integration_results: None,
        }
    }

    fn generate_id() -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("TASK-{}", &uuid[..8])
    }

    /// Set the initial priority. Does not record history.
    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = clamp_priority(priority);
        self
    }

    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_parent(mut self, parent_task_id: impl Into<String>) -> Self {
        self.parent_task_id = Some(parent_task_id.into());
        self
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn related_task_ids(&self) -> &[String] {
        &self.related_task_ids
    }

    /// Change the priority, clamped to `[0, 100]`, recording the change.
    pub fn update_priority(&mut self, new_priority: f64, reason: Option<&str>) {
        let old_priority = self.priority;
        self.priority = clamp_priority(new_priority);
        self.updated_at = Utc::now();

        let message = reason.map(str::to_string).unwrap_or_else(|| {
            format!(
                "Priority updated from {} to {}",
                old_priority, self.priority
            )
        });
        self.history.push(HistoryEntry {
            timestamp: self.updated_at,
            status: self.status,
            change: HistoryChange::PriorityChange {
                old_priority,
                new_priority: self.priority,
            },
            message,
        });
    }

    /// Set the status unconditionally and record it. Transition rules are
    /// enforced by [`crate::task::LifecycleManager`].
    pub(crate) fn update_status(&mut self, status: TaskStatus, message: &str) {
        self.status = status;
        self.updated_at = Utc::now();

        let message = if message.is_empty() {
            format!("Status updated to {}", status)
        } else {
            message.to_string()
        };
        self.history.push(HistoryEntry {
            timestamp: self.updated_at,
            status,
            change: HistoryChange::StatusChange,
            message,
        });
    }

    /// Link a related (non-hierarchical) task. Linking the same id twice is a no-op.
    pub fn add_related_task(&mut self, task_id: &str, relationship_type: &str) -> bool {
        if self.related_task_ids.iter().any(|id| id == task_id) {
            return false;
        }
        self.related_task_ids.push(task_id.to_string());
        self.updated_at = Utc::now();
        self.history.push(HistoryEntry {
            timestamp: self.updated_at,
            status: self.status,
            change: HistoryChange::RelationshipAdded {
                related_task: task_id.to_string(),
                relationship_type: relationship_type.to_string(),
            },
            message: format!("Related to {} ({})", task_id, relationship_type),
        });
        true
    }

    /// Status entries only, oldest first.
    pub fn status_history(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> + '_ {
        self.history
            .iter()
            .filter(|entry| matches!(entry.change, HistoryChange::StatusChange))
    }
}

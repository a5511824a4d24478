//! Persistence backend contract.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::task::{Project, Task, TaskStatus};

/// Criteria for listing tasks. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub project_id: Option<String>,
    pub parent_task_id: Option<String>,
    /// Skip completed and failed tasks.
    pub exclude_terminal: bool,
}

impl TaskFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Tasks that may still need processing.
    pub fn pending() -> Self {
        Self {
            exclude_terminal: true,
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
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

    pub fn matches(&self, task: &Task) -> bool {
        if self.exclude_terminal && task.status().is_terminal() {
            return false;
        }
        if let Some(status) = self.status {
            if task.status() != status {
                return false;
            }
        }
        if let Some(ref project_id) = self.project_id {
            if task.project_id.as_deref() != Some(project_id.as_str()) {
                return false;
            }
        }
        if let Some(ref parent) = self.parent_task_id {
            if task.parent_task_id.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Storage backend for tasks and projects.
///
/// Implementations must treat absent and unreadable records as not found
/// (`Ok(None)` or omitted from listings) rather than failing.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    async fn load(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn save(&self, task: &Task) -> Result<(), StoreError>;

    /// Tasks matching `filter`, oldest first.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    /// Returns true if a record was removed.
    async fn delete(&self, task_id: &str) -> Result<bool, StoreError>;

    async fn load_project(&self, project_id: &str) -> Result<Option<Project>, StoreError>;

    async fn save_project(&self, project: &Project) -> Result<(), StoreError>;

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;
}

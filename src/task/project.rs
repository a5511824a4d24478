//! Projects group tasks and expose a status rolled up from their root tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::task::types::TaskStatus;

/// Aggregate status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Created,
    Active,
    Completed,
    Error,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Created => "created",
            ProjectStatus::Active => "active",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Error => "error",
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compute a project status from the statuses of its root tasks.
///
/// No root tasks keeps the project `Created`; all completed is `Completed`;
/// any errored root task is `Error`; anything else is `Active`.
pub fn rollup_status<I>(root_statuses: I) -> ProjectStatus
where
    I: IntoIterator<Item = TaskStatus>,
{
    let mut seen_any = false;
    let mut all_completed = true;
    let mut any_error = false;

    for status in root_statuses {
        seen_any = true;
        all_completed &= status == TaskStatus::Completed;
        any_error |= status == TaskStatus::Error;
    }

    if !seen_any {
        ProjectStatus::Created
    } else if all_completed {
        ProjectStatus::Completed
    } else if any_error {
        ProjectStatus::Error
    } else {
        ProjectStatus::Active
    }
}

/// A named collection of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub root_task_ids: Vec<String>,
    #[serde(default)]
    pub all_task_ids: Vec<String>,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        let uuid = Uuid::new_v4().simple().to_string();
        Self {
            id: format!("PROJ-{}", &uuid[..8]),
            name: name.into(),
            description: description.into(),
            root_task_ids: Vec::new(),
            all_task_ids: Vec::new(),
            status: ProjectStatus::Created,
            created_at: now,
            updated_at: now,
        }
    }

    /// Register a task. Root tasks also feed the status rollup.
    pub fn add_task(&mut self, task_id: &str, is_root: bool) {
        if !self.all_task_ids.iter().any(|id| id == task_id) {
            self.all_task_ids.push(task_id.to_string());
        }
        if is_root && !self.root_task_ids.iter().any(|id| id == task_id) {
            self.root_task_ids.push(task_id.to_string());
        }
        self.updated_at = Utc::now();
    }

    pub fn remove_task(&mut self, task_id: &str) {
        self.all_task_ids.retain(|id| id != task_id);
        self.root_task_ids.retain(|id| id != task_id);
        self.updated_at = Utc::now();
    }

    /// Recompute the status; returns true if it changed.
    pub fn refresh_status<I>(&mut self, root_statuses: I) -> bool
    where
        I: IntoIterator<Item = TaskStatus>,
    {
        let status = rollup_status(root_statuses);
        if status == self.status {
            return false;
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }
}

//! In-process persistence backend.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::backend::{PersistenceStore, TaskFilter};
use crate::error::StoreError;
use crate::task::{Project, Task};

/// Keeps tasks and projects in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    projects: RwLock<HashMap<String, Project>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.read().expect("tasks lock poisoned").len()
    }
}

#[async_trait]
impl PersistenceStore for MemoryStore {
    async fn load(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .expect("tasks lock poisoned")
            .get(task_id)
            .cloned())
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks
            .write()
            .expect("tasks lock poisoned")
            .insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .tasks
            .read()
            .expect("tasks lock poisoned")
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .tasks
            .write()
            .expect("tasks lock poisoned")
            .remove(task_id)
            .is_some())
    }

    async fn load_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        Ok(self
            .projects
            .read()
            .expect("projects lock poisoned")
            .get(project_id)
            .cloned())
    }

    async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
        self.projects
            .write()
            .expect("projects lock poisoned")
            .insert(project.id.clone(), project.clone());
        Ok(())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects: Vec<Project> = self
            .projects
            .read()
            .expect("projects lock poisoned")
            .values()
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }
}

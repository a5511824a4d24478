//! Cache of live tasks and projects in front of a persistence backend.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use super::backend::{PersistenceStore, TaskFilter};
use crate::error::StoreError;
use crate::task::{Project, Task};

/// Owns the task-id to task cache shared by the engine and scheduler.
///
/// Locks are only held while the cache itself is read or mutated; backend
/// I/O always happens afterwards on a cloned snapshot. See the module docs
/// of [`crate::store`] for the staleness window this implies.
pub struct TaskStore {
    backend: Arc<dyn PersistenceStore>,
    tasks: RwLock<HashMap<String, Task>>,
    projects: RwLock<HashMap<String, Project>>,
}

impl TaskStore {
    pub fn new(backend: Arc<dyn PersistenceStore>) -> Self {
        Self {
            backend,
            tasks: RwLock::new(HashMap::new()),
            projects: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn PersistenceStore> {
        &self.backend
    }

    /// Cached snapshot of a task, without touching the backend.
    pub fn snapshot(&self, task_id: &str) -> Option<Task> {
        self.tasks
            .read()
            .expect("task cache lock poisoned")
            .get(task_id)
            .cloned()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks
            .read()
            .expect("task cache lock poisoned")
            .contains_key(task_id)
    }

    /// Snapshot of every cached task matching `filter`.
    pub fn cached(&self, filter: &TaskFilter) -> Vec<Task> {
        self.tasks
            .read()
            .expect("task cache lock poisoned")
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.read().expect("task cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch a task, loading it from the backend on a cache miss.
    pub async fn get(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        if let Some(task) = self.snapshot(task_id) {
            return Ok(Some(task));
        }

        let Some(loaded) = self.backend.load(task_id).await? else {
            return Ok(None);
        };

        let mut tasks = self.tasks.write().expect("task cache lock poisoned");
        // Another caller may have cached a newer copy while we were loading.
        let task = tasks
            .entry(task_id.to_string())
            .or_insert(loaded)
            .clone();
        Ok(Some(task))
    }

    /// Cache a new task and persist it.
    pub async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let snapshot = task.clone();
        {
            let mut tasks = self.tasks.write().expect("task cache lock poisoned");
            tasks.insert(task.id.clone(), task);
        }
        self.backend.save(&snapshot).await
    }

    /// Apply `f` to a task and persist the result.
    ///
    /// `f` runs on a copy under the cache write lock; the copy replaces the
    /// cached task only when `f` succeeds, so a rejected mutation leaves both
    /// the cache and the backend untouched. Returns `Ok(None)` if the task
    /// does not exist.
    pub async fn update<F, R, E>(&self, task_id: &str, f: F) -> Result<Option<R>, E>
    where
        F: FnOnce(&mut Task) -> Result<R, E>,
        E: From<StoreError>,
    {
        if self.get(task_id).await?.is_none() {
            return Ok(None);
        }

        let (result, snapshot) = {
            let mut tasks = self.tasks.write().expect("task cache lock poisoned");
            let Some(cached) = tasks.get_mut(task_id) else {
                return Ok(None);
            };
            let mut working = cached.clone();
            let result = f(&mut working)?;
            *cached = working.clone();
            (result, working)
        };

        if let Err(e) = self.backend.save(&snapshot).await {
            warn!(task_id = %task_id, error = %e, "Task cache is ahead of persisted state");
            return Err(e.into());
        }
        Ok(Some(result))
    }

    /// Drop a task from the cache and the backend.
    pub async fn remove(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let cached = self
            .tasks
            .write()
            .expect("task cache lock poisoned")
            .remove(task_id);
        let removed = self.backend.delete(task_id).await?;

        match cached {
            Some(task) => Ok(Some(task)),
            None if removed => {
                debug!(task_id = %task_id, "Deleted uncached task from backend");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Load matching tasks from the backend into the cache.
    ///
    /// Tasks already cached keep their cached copy. Returns the cached view of
    /// every matching task.
    pub async fn warm(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let loaded = self.backend.list(filter).await?;

        let mut tasks = self.tasks.write().expect("task cache lock poisoned");
        let warmed = loaded
            .into_iter()
            .map(|task| {
                tasks
                    .entry(task.id.clone())
                    .or_insert(task)
                    .clone()
            })
            .filter(|task| filter.matches(task))
            .collect();
        Ok(warmed)
    }

    /// Re-save every cached task. Returns the number of failed saves.
    pub async fn flush(&self) -> usize {
        let snapshots = self.cached(&TaskFilter::all());
        let mut failures = 0;
        for task in &snapshots {
            if let Err(e) = self.backend.save(task).await {
                warn!(task_id = %task.id, error = %e, "Failed to flush task");
                failures += 1;
            }
        }
        failures
    }

    pub async fn get_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        let cached = self
            .projects
            .read()
            .expect("project cache lock poisoned")
            .get(project_id)
            .cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let Some(loaded) = self.backend.load_project(project_id).await? else {
            return Ok(None);
        };
        let mut projects = self.projects.write().expect("project cache lock poisoned");
        Ok(Some(
            projects
                .entry(project_id.to_string())
                .or_insert(loaded)
                .clone(),
        ))
    }

    pub async fn insert_project(&self, project: Project) -> Result<(), StoreError> {
        let snapshot = project.clone();
        {
            let mut projects = self.projects.write().expect("project cache lock poisoned");
            projects.insert(project.id.clone(), project);
        }
        self.backend.save_project(&snapshot).await
    }

    /// Apply `f` to a project and persist it. Returns `Ok(None)` if absent.
    pub async fn update_project<F, R>(&self, project_id: &str, f: F) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&mut Project) -> R,
    {
        if self.get_project(project_id).await?.is_none() {
            return Ok(None);
        }

        let (result, snapshot) = {
            let mut projects = self.projects.write().expect("project cache lock poisoned");
            let Some(project) = projects.get_mut(project_id) else {
                return Ok(None);
            };
            let result = f(project);
            (result, project.clone())
        };

        self.backend.save_project(&snapshot).await?;
        Ok(Some(result))
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let loaded = self.backend.list_projects().await?;
        let mut projects = self.projects.write().expect("project cache lock poisoned");
        Ok(loaded
            .into_iter()
            .map(|project| {
                projects
                    .entry(project.id.clone())
                    .or_insert(project)
                    .clone()
            })
            .collect())
    }
}

//! JSON file persistence backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::backend::{PersistenceStore, TaskFilter};
use crate::error::StoreError;
use crate::task::{Project, Task};

/// Stores each task and project as a pretty-printed JSON file.
///
/// Layout under the base directory:
/// - `tasks/<task_id>.json`
/// - `projects/<project_id>.json`
pub struct JsonFileStore {
    base_path: PathBuf,
}

impl JsonFileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.base_path.join("tasks")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.base_path.join("projects")
    }

    /// Path of the file backing `task_id`.
    pub fn task_path(&self, task_id: &str) -> PathBuf {
        self.tasks_dir().join(format!("{}.json", file_stem(task_id)))
    }

    pub fn project_path(&self, project_id: &str) -> PathBuf {
        self.projects_dir()
            .join(format!("{}.json", file_stem(project_id)))
    }

    async fn ensure_directory(dir: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|source| StoreError::CreateDir {
                path: dir.display().to_string(),
                source,
            })
    }

    async fn write_record<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), StoreError> {
        Self::ensure_directory(dir).await?;

        let json = serde_json::to_string_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");
        let io_err = |source| StoreError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut file = fs::File::create(&tmp_path).await.map_err(io_err)?;
        file.write_all(json.as_bytes()).await.map_err(io_err)?;
        file.sync_all().await.map_err(io_err)?;
        drop(file);

        fs::rename(&tmp_path, path).await.map_err(io_err)
    }

    /// Read a record, treating missing and corrupt files as absent.
    async fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };

        match serde_json::from_str(&contents) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt record");
                Ok(None)
            }
        }
    }

    async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>, StoreError> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: dir.display().to_string(),
                    source,
                })
            }
        };

        let mut records = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| StoreError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let Some(entry) = entry else { break };

            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Maps an id onto a safe file stem.
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl PersistenceStore for JsonFileStore {
    async fn load(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        let task: Option<Task> = Self::read_record(&self.task_path(task_id)).await?;
        Ok(task.filter(|t| t.id == task_id))
    }

    async fn save(&self, task: &Task) -> Result<(), StoreError> {
        Self::write_record(&self.tasks_dir(), &self.task_path(&task.id), task).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = Self::read_all(&self.tasks_dir()).await?;
        tasks.retain(|task| filter.matches(task));
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn delete(&self, task_id: &str) -> Result<bool, StoreError> {
        let path = self.task_path(task_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    async fn load_project(&self, project_id: &str) -> Result<Option<Project>, StoreError> {
        let project: Option<Project> = Self::read_record(&self.project_path(project_id)).await?;
        Ok(project.filter(|p| p.id == project_id))
    }

    async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
        Self::write_record(&self.projects_dir(), &self.project_path(&project.id), project).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects: Vec<Project> = Self::read_all(&self.projects_dir()).await?;
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{LifecycleManager, TaskStatus};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_and_load_task() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        let mut task = Task::new("Parse config files", "rust").with_priority(70.0);
        LifecycleManager::new()
            .transition(&mut task, TaskStatus::Decomposing, "")
            .unwrap();
        store.save(&task).await.unwrap();

        assert!(store.task_path(&task.id).exists());
        let loaded = store.load(&task.id).await.unwrap().expect("task present");
        assert_eq!(loaded.id, task.id);
        assert_eq!(loaded.status(), TaskStatus::Decomposing);
        assert_eq!(loaded.history(), task.history());
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_records_are_not_found() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(store.load("TASK-missing").await.unwrap().is_none());

        std::fs::create_dir_all(store.tasks_dir()).unwrap();
        std::fs::write(store.task_path("TASK-broken"), "{ not json").unwrap();
        assert!(store.load("TASK-broken").await.unwrap().is_none());

        let good = Task::new("ok", "rust");
        store.save(&good).await.unwrap();
        let listed = store.list(&TaskFilter::all()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, good.id);
    }

    #[tokio::test]
    async fn test_list_filters_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        let a = Task::new("a", "rust").with_project("PROJ-1");
        let b = Task::new("b", "rust");
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let in_project = store
            .list(&TaskFilter::all().with_project("PROJ-1"))
            .await
            .unwrap();
        assert_eq!(in_project.len(), 1);
        assert_eq!(in_project[0].id, a.id);

        assert!(store.delete(&a.id).await.unwrap());
        assert!(!store.delete(&a.id).await.unwrap());
        assert_eq!(store.list(&TaskFilter::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_projects_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        let mut project = Project::new("parser", "Parser hardening");
        project.add_task("TASK-a", true);
        store.save_project(&project).await.unwrap();

        let loaded = store.load_project(&project.id).await.unwrap().unwrap();
        assert_eq!(loaded.root_task_ids, vec!["TASK-a"]);
        assert_eq!(store.list_projects().await.unwrap().len(), 1);
        assert!(store.load_project("PROJ-none").await.unwrap().is_none());
    }

    #[test]
    fn test_file_stem_sanitizes_separators() {
        assert_eq!(file_stem("TASK-1a2b"), "TASK-1a2b");
        assert_eq!(file_stem("../etc/passwd"), "___etc_passwd");
    }
}

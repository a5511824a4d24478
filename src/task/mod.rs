//! Task data model, lifecycle state machine and project rollup.
//!
//! A [`Task`] is the unit of work pushed through the production stages.
//! Status changes go through [`LifecycleManager`], which enforces the
//! transition table and keeps the append-only history consistent.
//!
//! # Example
//!
//! ```
//! use stage_forge::task::{LifecycleManager, Task, TaskStatus};
//!
//! let mut task = Task::new("Add input validation to the parser", "rust").with_priority(140.0);
//! assert_eq!(task.priority(), 100.0);
//!
//! let lifecycle = LifecycleManager::new();
//! lifecycle.transition(&mut task, TaskStatus::Decomposing, "Decomposing task").unwrap();
//! assert_eq!(task.history().len(), 1);
//! ```

pub mod lifecycle;
pub mod project;
pub mod types;

pub use lifecycle::LifecycleManager;
pub use project::{rollup_status, Project, ProjectStatus};
pub use types::{
    clamp_priority, CodeArtifacts, CodeFile, HistoryChange, HistoryEntry, StageReport, Task,
    TaskStatus, DEFAULT_PRIORITY,
};

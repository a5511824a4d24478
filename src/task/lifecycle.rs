//! Task state machine.
//!
//! Every status change goes through [`LifecycleManager::transition`], which
//! checks the transition table and appends the history entry.

use std::collections::HashMap;

use crate::error::LifecycleError;
use crate::task::types::{Task, TaskStatus};

/// Manages task lifecycle state transitions.
///
/// Enforces the transition table and records every accepted transition in
/// the task's history. Rejected transitions leave the task untouched.
pub struct LifecycleManager {
    valid_transitions: HashMap<TaskStatus, Vec<TaskStatus>>,
}

impl LifecycleManager {
    /// Create a lifecycle manager with the standard stage transitions.
    ///
    /// Valid transitions:
    /// - Created -> Decomposing, or straight to ReadyForImplementation when
    ///   decomposition is skipped
    /// - Decomposing -> ReadyForImplementation
    /// - ReadyFor<Stage> -> <Stage>
    /// - Implementing / Testing / QualityCheck -> next ReadyFor*, or NeedsRevision
    /// - ReadyForIntegration -> NeedsRevision when a subtask has failed
    /// - Integrating -> Completed, or NeedsRevision
    /// - NeedsRevision -> ReadyForImplementation (reopen) or Failed (abandon)
    /// - Error -> any resumable checkpoint (reopen) or Failed (abandon)
    /// - every non-terminal status -> Error
    pub fn new() -> Self {
        use TaskStatus::*;

        let mut valid_transitions = HashMap::new();

        valid_transitions.insert(Created, vec![Decomposing, ReadyForImplementation]);
        valid_transitions.insert(Decomposing, vec![ReadyForImplementation]);
        valid_transitions.insert(ReadyForImplementation, vec![Implementing]);
        valid_transitions.insert(Implementing, vec![ReadyForTesting, NeedsRevision]);
        valid_transitions.insert(ReadyForTesting, vec![Testing]);
        valid_transitions.insert(Testing, vec![ReadyForQuality, NeedsRevision]);
        valid_transitions.insert(ReadyForQuality, vec![QualityCheck]);
        valid_transitions.insert(QualityCheck, vec![ReadyForIntegration, NeedsRevision]);
        valid_transitions.insert(ReadyForIntegration, vec![Integrating, NeedsRevision]);
        valid_transitions.insert(Integrating, vec![Completed, NeedsRevision]);
        valid_transitions.insert(NeedsRevision, vec![ReadyForImplementation, Failed]);
        valid_transitions.insert(
            Error,
            vec![
                Created,
                ReadyForImplementation,
                ReadyForTesting,
                ReadyForQuality,
                ReadyForIntegration,
                Failed,
            ],
        );
        valid_transitions.insert(Completed, vec![]);
        valid_transitions.insert(Failed, vec![]);

        for (from, targets) in valid_transitions.iter_mut() {
            if !from.is_terminal() && *from != Error {
                targets.push(Error);
            }
        }

        Self { valid_transitions }
    }

    /// Check if a transition between two statuses is allowed.
    pub fn can_transition(&self, from: TaskStatus, to: TaskStatus) -> bool {
        self.valid_transitions
            .get(&from)
            .map(|targets| targets.contains(&to))
            .unwrap_or(false)
    }

    /// Statuses reachable from `from` in one step.
    pub fn targets(&self, from: TaskStatus) -> &[TaskStatus] {
        self.valid_transitions
            .get(&from)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Move a task to `new_status`, appending one history entry.
    ///
    /// # Errors
    /// Returns `LifecycleError::Terminal` if the task is already completed or
    /// failed, and `LifecycleError::InvalidTransition` for any other
    /// transition missing from the table.
    pub fn transition(
        &self,
        task: &mut Task,
        new_status: TaskStatus,
        message: &str,
    ) -> Result<(), LifecycleError> {
        let current = task.status();

        if current.is_terminal() {
            return Err(LifecycleError::Terminal(current));
        }

        if !self.can_transition(current, new_status) {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: new_status,
            });
        }

        task.update_status(new_status, message);
        Ok(())
    }

    /// The checkpoint a task in `NeedsRevision` or `Error` re-enters when reopened.
    ///
    /// Revisions always restart at implementation. Faulted tasks resume from the
    /// most recent resumable status in their history, or `Created` if they
    /// faulted before reaching one.
    pub fn resume_point(&self, task: &Task) -> Option<TaskStatus> {
        match task.status() {
            TaskStatus::NeedsRevision => Some(TaskStatus::ReadyForImplementation),
            TaskStatus::Error => Some(
                task.status_history()
                    .rev()
                    .map(|entry| entry.status)
                    .find(TaskStatus::is_resumable)
                    .unwrap_or(TaskStatus::Created),
            ),
            _ => None,
        }
    }
}

impl Default for LifecycleManager {
    fn default() -> Self {
        Self::new()
    }
}

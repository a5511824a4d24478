//! Priority scheduling on top of the task store.
//!
//! The queue only orders ids; priorities themselves live on the stored tasks
//! and every change goes through the store first.

use std::sync::Arc;

use tracing::{debug, info};

use super::queue::TaskQueue;
use crate::error::StoreError;
use crate::metrics::MetricsCollector;
use crate::store::{TaskFilter, TaskStore};
use crate::task::Task;

/// Orders pending tasks for the engine.
///
/// Wraps a [`TaskQueue`] and the shared [`TaskStore`] so priority changes are
/// persisted and reflected in the queue together.
pub struct PriorityScheduler {
    store: Arc<TaskStore>,
    queue: TaskQueue,
    metrics: MetricsCollector,
}

impl PriorityScheduler {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self {
            store,
            queue: TaskQueue::new(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn enqueue(&self, task: &Task) -> bool {
        self.enqueue_id(&task.id, task.priority())
    }

    pub fn enqueue_id(&self, task_id: &str, priority: f64) -> bool {
        let queued = self.queue.enqueue(task_id, priority);
        if queued {
            debug!(task_id, priority, "Task queued");
        }
        self.metrics.set_queue_depth(self.queue.len());
        queued
    }

    /// Queue `task` at its priority unless it is already queued.
    pub fn ensure_queued(&self, task: &Task) -> bool {
        let queued = self.queue.enqueue_if_absent(&task.id, task.priority());
        if queued {
            debug!(task_id = %task.id, priority = task.priority(), "Task queued");
            self.metrics.set_queue_depth(self.queue.len());
        }
        queued
    }

    pub fn next(&self) -> Option<String> {
        let next = self.queue.dequeue();
        self.metrics.set_queue_depth(self.queue.len());
        next
    }

    pub fn remove(&self, task_id: &str) -> bool {
        let removed = self.queue.remove(task_id);
        self.metrics.set_queue_depth(self.queue.len());
        removed
    }

    /// Re-key a queued task after its priority changed. Unqueued ids are
    /// left alone.
    pub fn reprioritize(&self, task_id: &str, priority: f64) {
        if self.queue.rekey(task_id, priority) {
            debug!(task_id, priority, "Queued task re-keyed");
        }
    }

    /// Spread priorities evenly over `[0, 100]`.
    ///
    /// Tasks are ranked by current priority (descending), then creation
    /// time; rank `i` of `n` gets `100 - i * 100 / (n - 1)` and a lone task
    /// gets 100. With `task_ids` unset every cached task is rebalanced;
    /// unknown ids are ignored. Only tasks whose priority changes are
    /// persisted and re-keyed. Returns the number of changed tasks.
    pub async fn rebalance(&self, task_ids: Option<&[String]>) -> Result<usize, StoreError> {
        let mut tasks = match task_ids {
            Some(ids) => {
                let mut tasks = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(task) = self.store.get(id).await? {
                        if !tasks.iter().any(|t: &Task| t.id == task.id) {
                            tasks.push(task);
                        }
                    }
                }
                tasks
            }
            None => self.store.cached(&TaskFilter::all()),
        };

        if tasks.is_empty() {
            return Ok(0);
        }

        tasks.sort_by(|a, b| {
            b.priority()
                .total_cmp(&a.priority())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let n = tasks.len();
        let mut changed = 0;
        for (rank, task) in tasks.iter().enumerate() {
            let target = if n == 1 {
                100.0
            } else {
                100.0 - (rank as f64) * 100.0 / ((n - 1) as f64)
            };
            if task.priority() == target {
                continue;
            }

            let updated = self
                .store
                .update(&task.id, |t| {
                    t.update_priority(target, Some("Priority rebalanced"));
                    Ok::<_, StoreError>(())
                })
                .await?;
            if updated.is_some() {
                self.reprioritize(&task.id, target);
                changed += 1;
            }
        }

        info!(tasks = n, changed, "Rebalanced task priorities");
        Ok(changed)
    }
}

//! Background loop driving an [`OrchestrationEngine`].
//!
//! One worker per engine: it dequeues a task, processes it, and sleeps for
//! the poll interval whenever there is nothing to advance. Shutdown goes
//! through a broadcast channel and lets the current task finish.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::{OrchestrationEngine, ProcessOutcome};

/// Errors that can occur when starting or stopping a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Worker is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Counters for processed tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub advanced: u64,
    pub waiting: u64,
    pub skipped: u64,
    pub faulted: u64,
}

impl WorkerStats {
    pub fn total_processed(&self) -> u64 {
        self.advanced + self.waiting + self.skipped + self.faulted
    }
}

#[derive(Default)]
struct SharedStats {
    advanced: AtomicU64,
    waiting: AtomicU64,
    skipped: AtomicU64,
    faulted: AtomicU64,
}

impl SharedStats {
    fn record(&self, outcome: &ProcessOutcome) {
        let counter = match outcome {
            ProcessOutcome::Advanced { .. } => &self.advanced,
            ProcessOutcome::Waiting => &self.waiting,
            ProcessOutcome::Skipped => &self.skipped,
            ProcessOutcome::Faulted(_) => &self.faulted,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            advanced: self.advanced.load(Ordering::SeqCst),
            waiting: self.waiting.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            faulted: self.faulted.load(Ordering::SeqCst),
        }
    }
}

/// Runs the poll, process, sleep loop for one engine.
pub struct EngineWorker {
    engine: Arc<OrchestrationEngine>,
    shutdown_tx: broadcast::Sender<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SharedStats>,
    is_running: AtomicBool,
    shutdown_timeout: Duration,
}

impl EngineWorker {
    pub fn new(engine: Arc<OrchestrationEngine>) -> Self {
        // A single shutdown signal is ever sent.
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            engine,
            shutdown_tx,
            handle: None,
            stats: Arc::new(SharedStats::default()),
            is_running: AtomicBool::new(false),
            shutdown_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Spawn the loop on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AlreadyRunning` if the worker was started before.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        let engine = Arc::clone(&self.engine);
        let stats = Arc::clone(&self.stats);
        let shutdown_rx = self.shutdown_tx.subscribe();
        self.handle = Some(tokio::spawn(run_loop(engine, stats, shutdown_rx)));

        info!(
            poll_interval_ms = self.engine.config().poll_interval.as_millis() as u64,
            "Engine worker started"
        );
        Ok(())
    }

    /// Signal the loop to stop and wait for the current task to finish.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::NotRunning` if the worker was never started and
    /// `WorkerError::ShutdownTimeout` if the loop does not stop in time.
    pub async fn shutdown(&mut self) -> Result<(), WorkerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(WorkerError::NotRunning);
        }

        info!("Stopping engine worker");
        // The loop may already have exited.
        let _ = self.shutdown_tx.send(());

        let result = match self.handle.take() {
            Some(handle) => match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    error!(error = %e, "Engine worker panicked");
                    Ok(())
                }
                Err(_) => Err(WorkerError::ShutdownTimeout(self.shutdown_timeout)),
            },
            None => Ok(()),
        };

        self.is_running.store(false, Ordering::SeqCst);
        info!("Engine worker stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.snapshot()
    }
}

async fn run_loop(
    engine: Arc<OrchestrationEngine>,
    stats: Arc<SharedStats>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let poll_interval = engine.config().poll_interval;

    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(broadcast::error::TryRecvError::Empty) => {}
        }

        let idle = match engine.process_next().await {
            Some((task_id, outcome)) => {
                debug!(task_id = %task_id, outcome = ?outcome, "Processed task");
                stats.record(&outcome);
                // A parent whose subtasks are all parked is the only thing
                // queued; back off instead of spinning on it.
                matches!(outcome, ProcessOutcome::Waiting)
            }
            None => true,
        };

        if idle {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown_rx.recv() => break,
            }
        }
    }

    info!("Engine worker loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, StageOperations, StageOutcome};
    use crate::agents::AgentError;
    use crate::store::{MemoryStore, TaskStore};
    use crate::task::{Task, TaskStatus};
    use async_trait::async_trait;

    struct NoSubtaskOps;

    #[async_trait]
    impl StageOperations for NoSubtaskOps {
        async fn decompose(&self, _task: &Task) -> Result<Vec<String>, AgentError> {
            Ok(Vec::new())
        }

        async fn implement(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::failed("no code blocks"))
        }

        async fn test(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::passed(""))
        }

        async fn assess(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::passed(""))
        }

        async fn integrate(&self, _task: &Task) -> Result<StageOutcome, AgentError> {
            Ok(StageOutcome::passed(""))
        }
    }

    fn engine() -> Arc<OrchestrationEngine> {
        let store = Arc::new(TaskStore::new(Arc::new(MemoryStore::new())));
        let config = EngineConfig::default().with_poll_interval(Duration::from_millis(10));
        Arc::new(OrchestrationEngine::new(config, store, Arc::new(NoSubtaskOps)))
    }

    #[tokio::test]
    async fn test_worker_processes_until_parked() {
        let engine = engine();
        let task = engine.submit_task(Task::new("t", "rust")).await.unwrap();

        let mut worker = EngineWorker::new(Arc::clone(&engine));
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(WorkerError::AlreadyRunning)));

        let mut status = TaskStatus::Created;
        for _ in 0..100 {
            status = engine.get_task(&task.id).await.unwrap().unwrap().status();
            if status == TaskStatus::NeedsRevision {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, TaskStatus::NeedsRevision);

        worker.shutdown().await.unwrap();
        assert!(!worker.is_running());
        assert_eq!(worker.stats().advanced, 2);
    }

    #[tokio::test]
    async fn test_shutdown_without_start_fails() {
        let mut worker = EngineWorker::new(engine());
        assert!(matches!(worker.shutdown().await, Err(WorkerError::NotRunning)));
    }

    #[test]
    fn test_stats_total() {
        let stats = WorkerStats {
            advanced: 3,
            waiting: 1,
            skipped: 0,
            faulted: 2,
        };
        assert_eq!(stats.total_processed(), 6);
    }
}

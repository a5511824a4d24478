//! Task scheduling.
//!
//! - **TaskQueue**: in-process priority queue of task ids, highest priority
//!   first, earliest enqueue first among equals
//! - **PriorityScheduler**: the queue plus the task store, for priority
//!   changes and rebalancing
//! - **EngineWorker**: the background poll loop feeding the engine
//!
//! # Architecture
//!
//! ```text
//!   submit / reopen / load_pending
//!                 │
//!          ┌──────▼───────┐
//!          │  TaskQueue   │
//!          └──────┬───────┘
//!                 │ dequeue
//!          ┌──────▼───────┐        ┌─────────────┐
//!          │ EngineWorker ├───────►│   Engine    │
//!          └──────────────┘        └──────┬──────┘
//!                 ▲   re-enqueue while    │
//!                 └───── actionable ──────┘
//! ```
//!
//! The queue is unbounded; nothing pushes back on producers.

pub mod priority;
pub mod queue;
pub mod worker;

pub use priority::PriorityScheduler;
pub use queue::TaskQueue;
pub use worker::{EngineWorker, WorkerError, WorkerStats};

//! Task and project persistence.
//!
//! [`PersistenceStore`] is the pluggable backend contract; [`JsonFileStore`]
//! keeps one JSON document per record on disk and [`MemoryStore`] keeps
//! everything in process. [`TaskStore`] owns the in-memory cache in front of
//! a backend and is what the engine and scheduler share.
//!
//! # Staleness window
//!
//! The cache is authoritative. Mutations are applied to the cache first and
//! then written to the backend after the cache lock is released. If that
//! write fails, the caller receives the error and the persisted copy stays
//! behind the cache until the next successful save of the same record.

pub mod backend;
pub mod cache;
pub mod file;
pub mod memory;

pub use backend::{PersistenceStore, TaskFilter};
pub use cache::TaskStore;
pub use file::JsonFileStore;
pub use memory::MemoryStore;

//! # rowq-core - Core types and worker engine for a database-backed task queue
//!
//! Tasks live as rows in one table. Workers claim them with a locking
//! read-then-update (the "pop"), run the behavior registered for the task's
//! `type`, and record `success` or `failed` on the row.
//!
//! This crate provides:
//! - `Task`, `TaskId`, `TaskStatus`, `NewTask` record types
//! - `TaskStore` trait for storage implementations
//! - `TaskKind` trait and `TaskRegistry` for polymorphic dispatch
//! - `Executor`, `Worker` and `WorkerPool` for processing tasks
//! - `Maintenance` for resetting orphaned or failed tasks
//! - `Client` for enqueueing tasks
//! - Error types
//!
//! ## Example
//!
//! ```rust,ignore
//! use rowq_core::{TaskKind, TaskRegistry, WorkerConfig, WorkerPool};
//! use rowq_sqlite::SqliteStore;
//!
//! let store = SqliteStore::in_memory("app").await?;
//! let registry = TaskRegistry::new().with(SendEmail)?;
//! let pool = WorkerPool::new(WorkerConfig::from_env()?, store, registry);
//! pool.run().await?;
//! ```

mod client;
mod config;
mod context;
mod error;
mod executor;
mod filter;
mod kind;
mod maintenance;
mod pool;
mod store;
mod task;
mod worker;

// Re-export main types
pub use client::Client;
pub use config::{WorkerConfig, WorkerConfigBuilder};
pub use context::{TaskContext, POLLS_KEY, WORKER_ID_KEY};
pub use error::{Result, RowqError};
pub use executor::{Executor, Outcome};
pub use filter::PopFilter;
pub use kind::{TaskError, TaskKind, TaskRegistry, TaskResult};
pub use maintenance::Maintenance;
pub use pool::{PoolStats, WorkerPool};
pub use store::{tasks_table, TaskStore};
pub use task::{NewTask, StatusCounts, Task, TaskId, TaskStatus, DEFAULT_PRIORITY};
pub use worker::{Worker, WorkerStats};

// Used by `TaskKind` implementations in downstream crates.
pub use async_trait::async_trait;

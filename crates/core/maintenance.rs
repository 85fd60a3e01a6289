//! Recovery of orphaned and failed tasks.
//!
//! A worker that dies mid-task leaves its row `in_progress` forever. Cleanup
//! returns every such row to `new`; it is meant to run once at fleet startup,
//! before any worker polls. Single-task reset is the operator's tool for
//! re-running one failed or stuck task.

use crate::error::{Result, RowqError};
use crate::store::TaskStore;
use crate::task::{StatusCounts, TaskId};

/// Maintenance operations over a task store.
pub struct Maintenance<S: TaskStore> {
    store: S,
}

impl<S: TaskStore> Maintenance<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Reset all `in_progress` tasks to `new`.
    ///
    /// Running it again with nothing in progress changes nothing.
    pub async fn cleanup(&self) -> Result<u64> {
        let reset = self.store.cleanup().await?;

        if reset == 0 {
            tracing::debug!("No orphaned tasks to reset");
        } else {
            tracing::info!(count = reset, "Reset orphaned in-progress tasks");
        }

        Ok(reset)
    }

    /// Reset one `in_progress` or `failed` task to `new`.
    pub async fn reset_task(&self, id: TaskId) -> Result<()> {
        if self.store.reset_task(id).await? {
            tracing::info!(task_id = %id, "Task reset to new");
            Ok(())
        } else {
            Err(RowqError::TaskNotFound(format!(
                "{} (no in-progress or failed task with this id)",
                id
            )))
        }
    }

    /// Count tasks per status.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.store.status_counts().await
    }
}

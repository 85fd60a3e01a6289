//! Client for enqueueing tasks.

use serde::Serialize;

use crate::error::Result;
use crate::store::TaskStore;
use crate::task::{NewTask, StatusCounts, Task, TaskId};

/// Producer-side handle on the task table.
#[derive(Clone)]
pub struct Client<S: TaskStore> {
    store: S,
}

impl<S: TaskStore> Client<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Enqueue a task of `kind` with the default priority.
    pub async fn enqueue<T: Serialize>(&self, kind: &str, payload: &T) -> Result<TaskId> {
        self.enqueue_task(NewTask::new(kind).payload(payload)?).await
    }

    /// Enqueue a task of `kind` with an explicit priority.
    pub async fn enqueue_with_priority<T: Serialize>(
        &self,
        kind: &str,
        payload: &T,
        priority: i32,
    ) -> Result<TaskId> {
        self.enqueue_task(NewTask::new(kind).priority(priority).payload(payload)?)
            .await
    }

    /// Enqueue a pre-built task.
    pub async fn enqueue_task(&self, task: NewTask) -> Result<TaskId> {
        let inserted = self.store.insert_task(&task).await?;
        tracing::debug!(
            task_id = %inserted.id,
            kind = %inserted.kind,
            priority = inserted.priority,
            "Task enqueued"
        );
        Ok(inserted.id)
    }

    /// Fetch a task by id.
    pub async fn get(&self, id: TaskId) -> Result<Option<Task>> {
        self.store.get_task(id).await
    }

    /// Count tasks per status.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        self.store.status_counts().await
    }
}

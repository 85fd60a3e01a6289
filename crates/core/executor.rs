//! Runs one claimed task in its own store session.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::context::TaskContext;
use crate::error::Result;
use crate::kind::{TaskError, TaskRegistry};
use crate::store::TaskStore;
use crate::task::TaskId;

/// How an execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The body returned normally; `success` is committed.
    Succeeded,
    /// The body failed or panicked; its session was rolled back and the
    /// failure still has to be recorded.
    Failed { reason: String },
    /// The task row disappeared between claim and execution.
    Missing,
}

/// Executes claimed tasks.
///
/// Each execution opens a session separate from the one used to claim the
/// task, so a slow body never holds the claim lock.
pub struct Executor<S: TaskStore> {
    store: S,
    registry: Arc<TaskRegistry<S::Session>>,
}

impl<S: TaskStore + Clone> Clone for Executor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<S: TaskStore> Executor<S> {
    pub fn new(store: S, registry: Arc<TaskRegistry<S::Session>>) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &TaskRegistry<S::Session> {
        &self.registry
    }

    /// Run the body of task `id`.
    ///
    /// On success the `success` status commits in the same session as the
    /// body's writes. If the body fails, or its writes cannot be committed,
    /// the session is rolled back and the reason is returned; recording it is
    /// up to the caller. Errors opening the session or loading the task are
    /// returned as `Err`.
    pub async fn execute(&self, id: TaskId, ctx: &mut TaskContext) -> Result<Outcome> {
        let mut session = self.store.begin().await?;

        let task = match self.store.fetch_in_session(&mut session, id).await? {
            Some(task) => task,
            None => {
                self.store.rollback(session).await?;
                tracing::warn!(task_id = %id, "Claimed task vanished before execution");
                return Ok(Outcome::Missing);
            }
        };

        tracing::debug!(task_id = %id, kind = %task.kind, "Executing task");

        let result = match self.registry.get(&task.kind) {
            Some(kind) => AssertUnwindSafe(kind.run(&task, ctx, &mut session))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(TaskError::new(panic_message(panic.as_ref())))),
            None => Err(TaskError::new(format!(
                "no task kind registered for type '{}'",
                task.kind
            ))),
        };

        match result {
            Ok(()) => {
                // The body's writes only land at commit, so errors from here on
                // (deferred constraints, an aborted transaction) belong to the task.
                let committed = match self.store.mark_succeeded(&mut session, id).await {
                    Ok(()) => self.store.commit(session).await,
                    Err(e) => {
                        if let Err(rollback_err) = self.store.rollback(session).await {
                            tracing::warn!(
                                task_id = %id,
                                error = %rollback_err,
                                "Rollback after failed success update failed"
                            );
                        }
                        Err(e)
                    }
                };

                match committed {
                    Ok(()) => {
                        tracing::debug!(task_id = %id, "Task succeeded");
                        Ok(Outcome::Succeeded)
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %id, error = %e, "Task writes failed to commit");
                        Ok(Outcome::Failed {
                            reason: e.to_string(),
                        })
                    }
                }
            }
            Err(err) => {
                // The session may be unusable after a panic; dropping it still
                // rolls it back, and the failure is recorded in a new one.
                if let Err(e) = self.store.rollback(session).await {
                    tracing::warn!(task_id = %id, error = %e, "Rollback after task failure failed");
                }
                Ok(Outcome::Failed {
                    reason: err.message,
                })
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    format!("task panicked: {}", detail)
}

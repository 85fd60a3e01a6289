//! Store abstraction for the task table.
//!
//! The queue needs nothing from the database beyond the operations below.
//! Implementations exist for PostgreSQL (row locks via `FOR UPDATE`) and
//! SQLite (database-level write lock per statement).

use async_trait::async_trait;

use crate::error::{Result, RowqError};
use crate::filter::PopFilter;
use crate::task::{NewTask, StatusCounts, Task, TaskId};

/// Store trait for task queue operations.
///
/// Implementations must be thread-safe (Send + Sync) and cheap to clone,
/// typically a handle around a connection pool. Every call that does not take
/// a `Session` runs in its own short transaction.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// One open store transaction.
    ///
    /// Dropping a session without passing it to [`commit`](Self::commit)
    /// must roll it back.
    type Session: Send;

    /// Name of the task table this store reads and writes.
    fn table(&self) -> &str;

    /// Create the task table and its indexes if they do not exist.
    async fn init_schema(&self) -> Result<()>;

    // ========== Producer ==========

    /// Insert a task with status `new`.
    async fn insert_task(&self, task: &NewTask) -> Result<Task>;

    /// Fetch a task by id.
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>>;

    // ========== Pop Engine ==========

    /// Claim the best eligible task matching `filter`.
    ///
    /// Selection and the transition to `in_progress` happen in one
    /// transaction under a lock, and the claim is committed before this
    /// returns. Ordering is priority descending, then creation time and id
    /// ascending. Returns `None` when nothing qualifies.
    async fn pop_task(&self, filter: &PopFilter) -> Result<Option<Task>>;

    // ========== Execution sessions ==========

    /// Open a session for executing one task.
    async fn begin(&self) -> Result<Self::Session>;

    /// Commit a session.
    async fn commit(&self, session: Self::Session) -> Result<()>;

    /// Roll a session back.
    async fn rollback(&self, session: Self::Session) -> Result<()>;

    /// Fetch a task inside `session`.
    async fn fetch_in_session(
        &self,
        session: &mut Self::Session,
        id: TaskId,
    ) -> Result<Option<Task>>;

    /// Mark a task `success` inside `session`, so the status commits
    /// together with the task body's own writes.
    async fn mark_succeeded(&self, session: &mut Self::Session, id: TaskId) -> Result<()>;

    /// Mark a task `failed` with `reason`, in a fresh transaction.
    async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<()>;

    // ========== Maintenance ==========

    /// Reset every `in_progress` task to `new`, clearing its timestamps.
    ///
    /// Returns the number of tasks reset.
    async fn cleanup(&self) -> Result<u64>;

    /// Reset one `in_progress` or `failed` task to `new`.
    ///
    /// Returns `false` when no task with that id is in either status.
    async fn reset_task(&self, id: TaskId) -> Result<bool>;

    // ========== Inspection ==========

    /// Count tasks per status.
    async fn status_counts(&self) -> Result<StatusCounts>;
}

/// Name of the task table for `namespace`.
///
/// Namespaces end up in SQL identifiers, so only ASCII letters, digits and
/// `_` are accepted.
pub fn tasks_table(namespace: &str) -> Result<String> {
    let valid = !namespace.is_empty()
        && namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(RowqError::Config(format!(
            "invalid namespace '{}': use ASCII letters, digits and '_'",
            namespace
        )));
    }
    Ok(format!("{}_tasks", namespace))
}

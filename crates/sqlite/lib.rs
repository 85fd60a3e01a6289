//! SQLite task store for rowq.
//!
//! SQLite has no row locks. A pop is a single `UPDATE ... WHERE id = (SELECT
//! ...) RETURNING id` statement, which runs under the database write lock, so
//! two workers can never claim the same row. `PopFilter::skip_locked` has no
//! effect here.
//!
//! Timestamps are stored as INTEGER unix microseconds.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rowq_sqlite::SqliteStore;
//! use rowq_core::Client;
//!
//! #[tokio::main]
//! async fn main() -> rowq_core::Result<()> {
//!     let store = SqliteStore::new("sqlite:tasks.db?mode=rwc", "myapp").await?;
//!     let client = Client::new(store);
//!     client.enqueue("send_email", &serde_json::json!({ "to": "a@example.com" })).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, Transaction};

use rowq_core::{
    tasks_table, NewTask, PopFilter, Result, RowqError, StatusCounts, Task, TaskId, TaskStatus,
    TaskStore,
};

/// A transaction on the task database.
pub type SqliteSession = Transaction<'static, Sqlite>;

const TASK_COLUMNS: &str =
    r#"id, priority, status, fail_reason, started_at, terminated_at, created_at, "type", payload"#;

type TaskRow = (
    i64,
    i32,
    String,
    Option<String>,
    Option<i64>,
    Option<i64>,
    i64,
    String,
    String,
);

fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| RowqError::Backend(format!("Timestamp out of range: {}", micros)))
}

fn task_from_row(row: TaskRow) -> Result<Task> {
    let (id, priority, status, fail_reason, started_at, terminated_at, created_at, kind, payload) =
        row;
    Ok(Task {
        id: TaskId(id),
        priority,
        status: status
            .parse::<TaskStatus>()
            .map_err(|e| RowqError::Backend(format!("Bad status in task {}: {}", id, e)))?,
        fail_reason,
        started_at: started_at.map(from_micros).transpose()?,
        terminated_at: terminated_at.map(from_micros).transpose()?,
        created_at: from_micros(created_at)?,
        kind,
        payload: serde_json::from_str(&payload)?,
    })
}

fn push_statuses(qb: &mut QueryBuilder<'_, Sqlite>, filter: &PopFilter) {
    qb.push("status IN (");
    let mut statuses = qb.separated(", ");
    for status in filter.status_values() {
        statuses.push_bind(status);
    }
    statuses.push_unseparated(")");
}

/// Append the pop filter's conditions to `qb`.
fn push_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &PopFilter) {
    push_statuses(qb, filter);

    if !filter.include_types.is_empty() {
        qb.push(r#" AND "type" IN ("#);
        let mut kinds = qb.separated(", ");
        for kind in &filter.include_types {
            kinds.push_bind(kind.clone());
        }
        kinds.push_unseparated(")");
    }

    if !filter.exclude_types.is_empty() {
        qb.push(r#" AND "type" NOT IN ("#);
        let mut kinds = qb.separated(", ");
        for kind in &filter.exclude_types {
            kinds.push_bind(kind.clone());
        }
        kinds.push_unseparated(")");
    }

    if let Some(predicate) = &filter.raw_predicate {
        qb.push(" AND (");
        qb.push(predicate);
        qb.push(")");
    }
}

/// SQLite store for the task table.
///
/// Stores opened with [`new`](Self::new) or [`in_memory`](Self::in_memory)
/// hold a single connection, which every execution session borrows while its
/// task runs. Task bodies must do their database work through the session;
/// a body that goes through the store (or a `Client` over it) instead waits
/// for the session's own connection until the pool's acquire timeout.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    table: String,
}

impl SqliteStore {
    /// Open a SQLite database and create the task table if needed.
    ///
    /// The database_url should be in the format: `sqlite:path/to/db.sqlite` or `sqlite::memory:`
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to connect to SQLite: {}", e)))?;

        Self::with_pool(pool, namespace).await
    }

    /// Create an in-memory store (useful for testing).
    ///
    /// The single connection is never recycled, since closing it would
    /// discard the database.
    pub async fn in_memory(namespace: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to open in-memory SQLite: {}", e)))?;

        Self::with_pool(pool, namespace).await
    }

    /// Wrap an existing pool. The schema is not touched.
    ///
    /// With more than one connection, only the claim is safe to share: an
    /// execution session reads before it writes, and SQLite rejects that
    /// upgrade when another connection has written in between.
    pub fn from_pool(pool: SqlitePool, namespace: &str) -> Result<Self> {
        Ok(Self {
            pool,
            table: tasks_table(namespace)?,
        })
    }

    async fn with_pool(pool: SqlitePool, namespace: &str) -> Result<Self> {
        let store = Self::from_pool(pool, namespace)?;
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    type Session = SqliteSession;

    fn table(&self) -> &str {
        &self.table
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                priority INTEGER NOT NULL DEFAULT 50,
                status TEXT NOT NULL DEFAULT 'new'
                    CHECK (status IN ('new', 'in_progress', 'success', 'failed')),
                fail_reason TEXT,
                started_at INTEGER,
                terminated_at INTEGER,
                created_at INTEGER NOT NULL,
                "type" TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{{}}'
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to create tasks table: {}", e)))?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx_{}_pop ON {} (status, priority DESC, created_at, id)",
            self.table, self.table
        ))
        .execute(&self.pool)
        .await
        .ok();

        Ok(())
    }

    async fn insert_task(&self, task: &NewTask) -> Result<Task> {
        let row: TaskRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO {} (priority, status, created_at, "type", payload)
            VALUES (?, 'new', ?, ?, ?)
            RETURNING {}
            "#,
            self.table, TASK_COLUMNS
        ))
        .bind(task.priority)
        .bind(now_micros())
        .bind(&task.kind)
        .bind(task.payload_json()?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to insert task: {}", e)))?;

        task_from_row(row)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            TASK_COLUMNS, self.table
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to get task: {}", e)))?;

        row.map(task_from_row).transpose()
    }

    async fn pop_task(&self, filter: &PopFilter) -> Result<Option<Task>> {
        filter.validate()?;

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "UPDATE {} SET status = 'in_progress', started_at = ",
            self.table
        ));
        qb.push_bind(now_micros());
        qb.push(format!(
            ", terminated_at = NULL WHERE id = (SELECT id FROM {} WHERE ",
            self.table
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1) AND ");
        push_statuses(&mut qb, filter);
        qb.push(" RETURNING id");

        let claimed: Option<(i64,)> = qb
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to pop task: {}", e)))?;

        match claimed {
            Some((id,)) => self.get_task(TaskId(id)).await,
            None => Ok(None),
        }
    }

    async fn begin(&self) -> Result<SqliteSession> {
        self.pool
            .begin()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to begin transaction: {}", e)))
    }

    async fn commit(&self, session: SqliteSession) -> Result<()> {
        session
            .commit()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to commit: {}", e)))
    }

    async fn rollback(&self, session: SqliteSession) -> Result<()> {
        session
            .rollback()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to roll back: {}", e)))
    }

    async fn fetch_in_session(
        &self,
        session: &mut SqliteSession,
        id: TaskId,
    ) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            TASK_COLUMNS, self.table
        ))
        .bind(id.0)
        .fetch_optional(&mut **session)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to fetch task: {}", e)))?;

        row.map(task_from_row).transpose()
    }

    async fn mark_succeeded(&self, session: &mut SqliteSession, id: TaskId) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = 'success', terminated_at = ? WHERE id = ?",
            self.table
        ))
        .bind(now_micros())
        .bind(id.0)
        .execute(&mut **session)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to mark task succeeded: {}", e)))?;
        Ok(())
    }

    async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'failed', fail_reason = ?, terminated_at = ? WHERE id = ?",
            self.table
        ))
        .bind(reason)
        .bind(now_micros())
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to mark task failed: {}", e)))?;

        if result.rows_affected() == 0 {
            tracing::warn!(task_id = %id, "Failed task vanished before its failure was recorded");
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'new', started_at = NULL, terminated_at = NULL \
             WHERE status = 'in_progress'",
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to clean up tasks: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn reset_task(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'new', started_at = NULL, terminated_at = NULL \
             WHERE id = ? AND status IN ('in_progress', 'failed')",
            self.table
        ))
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to reset task: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn status_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            self.table
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to count tasks: {}", e)))?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            let status = status
                .parse::<TaskStatus>()
                .map_err(|e| RowqError::Backend(format!("Bad status in tasks table: {}", e)))?;
            counts.add(status, count as u64);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowq_core::{
        async_trait, Client, Executor, Maintenance, Outcome, TaskContext, TaskError, TaskKind,
        TaskRegistry, TaskResult, Worker, WorkerConfig, WorkerPool, POLLS_KEY, WORKER_ID_KEY,
    };
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory("test").await.unwrap()
    }

    struct Awesome;

    #[async_trait]
    impl TaskKind<SqliteSession> for Awesome {
        fn kind(&self) -> &'static str {
            "awesome"
        }

        async fn run(
            &self,
            _task: &Task,
            ctx: &mut TaskContext,
            _session: &mut SqliteSession,
        ) -> TaskResult {
            ctx.increment("awesome");
            Ok(())
        }
    }

    struct Bad;

    #[async_trait]
    impl TaskKind<SqliteSession> for Bad {
        fn kind(&self) -> &'static str {
            "bad"
        }

        async fn run(
            &self,
            _task: &Task,
            _ctx: &mut TaskContext,
            _session: &mut SqliteSession,
        ) -> TaskResult {
            Err(TaskError::new("bad things happened"))
        }
    }

    struct Panicky;

    #[async_trait]
    impl TaskKind<SqliteSession> for Panicky {
        fn kind(&self) -> &'static str {
            "panicky"
        }

        async fn run(
            &self,
            _task: &Task,
            _ctx: &mut TaskContext,
            _session: &mut SqliteSession,
        ) -> TaskResult {
            panic!("boom");
        }
    }

    /// Writes its payload's `note` through the session, then fails if asked to.
    struct Note;

    #[async_trait]
    impl TaskKind<SqliteSession> for Note {
        fn kind(&self) -> &'static str {
            "note"
        }

        async fn run(
            &self,
            task: &Task,
            _ctx: &mut TaskContext,
            session: &mut SqliteSession,
        ) -> TaskResult {
            let payload: serde_json::Value = task.payload_as()?;
            let body = payload["body"].as_str().unwrap_or_default().to_string();
            sqlx::query("INSERT INTO notes (body) VALUES (?)")
                .bind(&body)
                .execute(&mut **session)
                .await?;
            if payload["fail"].as_bool().unwrap_or(false) {
                return Err(TaskError::new("note rejected"));
            }
            Ok(())
        }
    }

    /// Inserts a child row whose foreign key is only checked at commit.
    struct Orphaned;

    #[async_trait]
    impl TaskKind<SqliteSession> for Orphaned {
        fn kind(&self) -> &'static str {
            "orphaned"
        }

        async fn run(
            &self,
            _task: &Task,
            _ctx: &mut TaskContext,
            session: &mut SqliteSession,
        ) -> TaskResult {
            sqlx::query("INSERT INTO child (parent_id) VALUES (999)")
                .execute(&mut **session)
                .await?;
            Ok(())
        }
    }

    /// Records the id of every task it runs.
    struct Recorder {
        seen: Arc<Mutex<Vec<i64>>>,
    }

    #[async_trait]
    impl TaskKind<SqliteSession> for Recorder {
        fn kind(&self) -> &'static str {
            "awesome"
        }

        async fn run(
            &self,
            task: &Task,
            _ctx: &mut TaskContext,
            _session: &mut SqliteSession,
        ) -> TaskResult {
            self.seen.lock().unwrap().push(task.id.0);
            Ok(())
        }
    }

    fn registry() -> Arc<TaskRegistry<SqliteSession>> {
        Arc::new(
            TaskRegistry::new()
                .with(Awesome)
                .unwrap()
                .with(Bad)
                .unwrap()
                .with(Panicky)
                .unwrap()
                .with(Note)
                .unwrap()
                .with(Orphaned)
                .unwrap(),
        )
    }

    fn worker(store: &SqliteStore, filter: PopFilter, tries: usize) -> Worker<SqliteStore> {
        Worker::new(
            0,
            store.clone(),
            registry(),
            filter,
            Duration::from_millis(1),
            CancellationToken::new(),
        )
        .tries(tries)
    }

    async fn status_of(store: &SqliteStore, id: TaskId) -> TaskStatus {
        store.get_task(id).await.unwrap().unwrap().status
    }

    // ========== Pop Engine ==========

    #[tokio::test]
    async fn test_insert_task() {
        let store = store().await;
        let task = store
            .insert_task(
                &NewTask::new("awesome")
                    .priority(70)
                    .payload(&serde_json::json!({ "n": 1 }))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::New);
        assert_eq!(task.priority, 70);
        assert_eq!(task.kind, "awesome");
        assert_eq!(task.payload["n"], 1);
        assert!(task.started_at.is_none());
        assert!(task.terminated_at.is_none());
        assert!(task.fail_reason.is_none());
        assert_eq!(store.get_task(task.id).await.unwrap(), Some(task));
    }

    #[tokio::test]
    async fn test_pop_by_priority() {
        let store = store().await;
        for priority in [10, 90, 50] {
            store
                .insert_task(&NewTask::new("awesome").priority(priority))
                .await
                .unwrap();
        }

        let mut popped = Vec::new();
        while let Some(task) = store.pop_task(&PopFilter::default()).await.unwrap() {
            popped.push(task.priority);
        }
        assert_eq!(popped, vec![90, 50, 10]);
    }

    #[tokio::test]
    async fn test_pop_fifo_within_priority() {
        let store = store().await;
        let first = store.insert_task(&NewTask::new("awesome")).await.unwrap();
        let second = store.insert_task(&NewTask::new("awesome")).await.unwrap();
        let third = store.insert_task(&NewTask::new("awesome")).await.unwrap();

        let mut popped = Vec::new();
        while let Some(task) = store.pop_task(&PopFilter::default()).await.unwrap() {
            popped.push(task.id);
        }
        assert_eq!(popped, vec![first.id, second.id, third.id]);
    }

    #[tokio::test]
    async fn test_pop_marks_in_progress() {
        let store = store().await;
        let inserted = store.insert_task(&NewTask::new("awesome")).await.unwrap();

        let popped = store.pop_task(&PopFilter::default()).await.unwrap().unwrap();
        assert_eq!(popped.id, inserted.id);
        assert_eq!(popped.status, TaskStatus::InProgress);
        assert!(popped.started_at.is_some());
        assert!(popped.terminated_at.is_none());

        // Claimed tasks are no longer eligible
        assert!(store.pop_task(&PopFilter::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_empty() {
        let store = store().await;
        assert!(store.pop_task(&PopFilter::default()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_type_filters() {
        let store = store().await;
        let awesome = store
            .insert_task(&NewTask::new("awesome").priority(90))
            .await
            .unwrap();
        let bad = store.insert_task(&NewTask::new("bad")).await.unwrap();

        let only_bad = PopFilter::new().include_types(["bad"]);
        assert_eq!(store.pop_task(&only_bad).await.unwrap().unwrap().id, bad.id);
        assert!(store.pop_task(&only_bad).await.unwrap().is_none());

        let not_awesome = PopFilter::new().exclude_types(["awesome"]);
        assert!(store.pop_task(&not_awesome).await.unwrap().is_none());
        assert_eq!(status_of(&store, awesome.id).await, TaskStatus::New);
    }

    #[tokio::test]
    async fn test_pop_raw_predicate() {
        let store = store().await;
        store.insert_task(&NewTask::new("awesome").priority(90)).await.unwrap();
        let low = store.insert_task(&NewTask::new("awesome").priority(5)).await.unwrap();

        let filter = PopFilter::new().raw_predicate("priority < 10");
        assert_eq!(store.pop_task(&filter).await.unwrap().unwrap().id, low.id);
        assert!(store.pop_task(&filter).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pop_failed_status_for_retry() {
        let store = store().await;
        let task = store.insert_task(&NewTask::new("awesome")).await.unwrap();
        store.pop_task(&PopFilter::default()).await.unwrap();
        store.mark_failed(task.id, "flaky").await.unwrap();

        assert!(store.pop_task(&PopFilter::default()).await.unwrap().is_none());

        let retry = PopFilter::new().statuses([TaskStatus::Failed]);
        let popped = store.pop_task(&retry).await.unwrap().unwrap();
        assert_eq!(popped.id, task.id);
        assert_eq!(popped.status, TaskStatus::InProgress);
        assert!(popped.terminated_at.is_none());
    }

    #[tokio::test]
    async fn test_pop_rejects_invalid_filter() {
        let store = store().await;
        let filter = PopFilter::new().statuses([]);
        assert!(matches!(
            store.pop_task(&filter).await,
            Err(RowqError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_pop_bad_raw_predicate_is_backend_error() {
        let store = store().await;
        store.insert_task(&NewTask::new("awesome")).await.unwrap();
        let filter = PopFilter::new().raw_predicate("no_such_column = 1");
        assert!(matches!(
            store.pop_task(&filter).await,
            Err(RowqError::Backend(_))
        ));
    }

    // ========== Executor ==========

    #[tokio::test]
    async fn test_execute_success_sets_terminated_at() {
        let store = store().await;
        let task = store.insert_task(&NewTask::new("awesome")).await.unwrap();
        store.pop_task(&PopFilter::default()).await.unwrap();

        let executor = Executor::new(store.clone(), registry());
        let mut ctx = TaskContext::new();
        assert_eq!(
            executor.execute(task.id, &mut ctx).await.unwrap(),
            Outcome::Succeeded
        );

        let done = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Success);
        assert!(done.started_at.is_some());
        assert!(done.terminated_at.is_some());
        assert_eq!(ctx.counter("awesome"), 1);
    }

    #[tokio::test]
    async fn test_execute_missing_task() {
        let store = store().await;
        let executor = Executor::new(store, registry());
        assert_eq!(
            executor
                .execute(TaskId(999), &mut TaskContext::new())
                .await
                .unwrap(),
            Outcome::Missing
        );
    }

    #[tokio::test]
    async fn test_execute_failure_leaves_status_to_caller() {
        let store = store().await;
        let task = store.insert_task(&NewTask::new("bad")).await.unwrap();
        store.pop_task(&PopFilter::default()).await.unwrap();

        let executor = Executor::new(store.clone(), registry());
        let outcome = executor
            .execute(task.id, &mut TaskContext::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            Outcome::Failed {
                reason: "bad things happened".to_string()
            }
        );
        assert_eq!(status_of(&store, task.id).await, TaskStatus::InProgress);
    }

    // ========== Worker ==========

    #[tokio::test]
    async fn test_worker_runs_only_filtered_type() {
        let store = store().await;
        let client = Client::new(store.clone());
        let a = client.enqueue("awesome", &serde_json::json!({})).await.unwrap();
        let b = client.enqueue("bad", &serde_json::json!({})).await.unwrap();

        let stats = worker(&store, PopFilter::new().include_types(["bad"]), 1)
            .run(&mut TaskContext::new())
            .await
            .unwrap();
        assert_eq!(stats.polls, 1);
        assert_eq!(stats.failed, 1);

        let failed = store.get_task(b).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(!failed.fail_reason.unwrap_or_default().is_empty());
        assert!(failed.terminated_at.is_some());
        assert_eq!(status_of(&store, a).await, TaskStatus::New);
    }

    #[tokio::test]
    async fn test_worker_failure_does_not_stop_loop() {
        let store = store().await;
        let client = Client::new(store.clone());
        let bad = client
            .enqueue_with_priority("bad", &serde_json::json!({}), 90)
            .await
            .unwrap();
        let good = client.enqueue("awesome", &serde_json::json!({})).await.unwrap();

        let mut ctx = TaskContext::new();
        let stats = worker(&store, PopFilter::default(), 3)
            .run(&mut ctx)
            .await
            .unwrap();

        assert_eq!(stats.polls, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(status_of(&store, bad).await, TaskStatus::Failed);
        assert_eq!(status_of(&store, good).await, TaskStatus::Success);
        assert_eq!(ctx.counter("awesome"), 1);
    }

    #[tokio::test]
    async fn test_worker_records_panic_as_failure() {
        let store = store().await;
        let id = Client::new(store.clone())
            .enqueue("panicky", &serde_json::json!({}))
            .await
            .unwrap();

        let stats = worker(&store, PopFilter::default(), 1)
            .run(&mut TaskContext::new())
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.fail_reason.as_deref(), Some("task panicked: boom"));
    }

    #[tokio::test]
    async fn test_worker_fails_unknown_kind() {
        let store = store().await;
        let id = Client::new(store.clone())
            .enqueue("mystery", &serde_json::json!({}))
            .await
            .unwrap();

        worker(&store, PopFilter::default(), 1)
            .run(&mut TaskContext::new())
            .await
            .unwrap();

        let task = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(
            task.fail_reason.as_deref(),
            Some("no task kind registered for type 'mystery'")
        );
    }

    #[tokio::test]
    async fn test_session_writes_commit_or_roll_back_with_task() {
        let store = store().await;
        sqlx::query("CREATE TABLE notes (body TEXT NOT NULL)")
            .execute(store.pool())
            .await
            .unwrap();

        let client = Client::new(store.clone());
        let kept = client
            .enqueue("note", &serde_json::json!({ "body": "kept" }))
            .await
            .unwrap();
        let dropped = client
            .enqueue("note", &serde_json::json!({ "body": "dropped", "fail": true }))
            .await
            .unwrap();

        worker(&store, PopFilter::default(), 2)
            .run(&mut TaskContext::new())
            .await
            .unwrap();

        assert_eq!(status_of(&store, kept).await, TaskStatus::Success);
        let failed = store.get_task(dropped).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.fail_reason.as_deref(), Some("note rejected"));

        let notes: Vec<(String,)> = sqlx::query_as("SELECT body FROM notes")
            .fetch_all(store.pool())
            .await
            .unwrap();
        assert_eq!(notes, vec![("kept".to_string(),)]);
    }

    #[tokio::test]
    async fn test_commit_failure_is_recorded_as_task_failure() {
        let store = store().await;
        sqlx::query("CREATE TABLE parent (id INTEGER PRIMARY KEY)")
            .execute(store.pool())
            .await
            .unwrap();
        sqlx::query(
            "CREATE TABLE child (parent_id INTEGER NOT NULL \
             REFERENCES parent (id) DEFERRABLE INITIALLY DEFERRED)",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let client = Client::new(store.clone());
        let orphaned = client
            .enqueue_with_priority("orphaned", &serde_json::json!({}), 90)
            .await
            .unwrap();
        let next = client.enqueue("awesome", &serde_json::json!({})).await.unwrap();

        let stats = worker(&store, PopFilter::default(), 3)
            .run(&mut TaskContext::new())
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);

        let task = store.get_task(orphaned).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.terminated_at.is_some());
        assert!(
            task.fail_reason
                .as_deref()
                .unwrap_or_default()
                .contains("FOREIGN KEY"),
            "unexpected fail_reason: {:?}",
            task.fail_reason
        );
        assert_eq!(status_of(&store, next).await, TaskStatus::Success);

        let children: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM child")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(children.0, 0);
    }

    #[tokio::test]
    async fn test_worker_seeds_context() {
        let store = store().await;
        let worker = Worker::new(
            7,
            store,
            registry(),
            PopFilter::default(),
            Duration::from_millis(1),
            CancellationToken::new(),
        )
        .tries(3);

        let mut ctx = TaskContext::new();
        worker.run(&mut ctx).await.unwrap();
        assert_eq!(ctx.get(WORKER_ID_KEY), Some(&serde_json::json!(7)));
        assert_eq!(ctx.counter(POLLS_KEY), 3);
    }

    #[tokio::test]
    async fn test_worker_tries_bound_empty_queue() {
        let store = store().await;
        let stats = worker(&store, PopFilter::default(), 3)
            .run(&mut TaskContext::new())
            .await
            .unwrap();
        assert_eq!(stats.polls, 3);
        assert_eq!(stats.executed(), 0);
    }

    #[tokio::test]
    async fn test_worker_stops_when_cancelled() {
        let store = store().await;
        store.insert_task(&NewTask::new("awesome")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let worker = Worker::new(
            0,
            store.clone(),
            registry(),
            PopFilter::default(),
            Duration::from_secs(60),
            cancel,
        );

        let stats = worker.run(&mut TaskContext::new()).await.unwrap();
        assert_eq!(stats.polls, 0);
        assert_eq!(store.status_counts().await.unwrap().new, 1);
    }

    #[tokio::test]
    async fn test_worker_cancel_interrupts_poll_gap() {
        let store = store().await;
        let cancel = CancellationToken::new();
        let worker = Worker::new(
            0,
            store,
            registry(),
            PopFilter::default(),
            Duration::from_secs(3600),
            cancel.clone(),
        );

        let handle = tokio::spawn(async move { worker.run(&mut TaskContext::new()).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let stats = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(stats.polls, 1);
    }

    // ========== Maintenance ==========

    #[tokio::test]
    async fn test_cleanup_resets_orphans_and_is_idempotent() {
        let store = store().await;
        for _ in 0..3 {
            store.insert_task(&NewTask::new("awesome")).await.unwrap();
        }
        store.pop_task(&PopFilter::default()).await.unwrap();
        store.pop_task(&PopFilter::default()).await.unwrap();

        let maintenance = Maintenance::new(store.clone());
        assert_eq!(maintenance.cleanup().await.unwrap(), 2);

        let counts = maintenance.status_counts().await.unwrap();
        assert_eq!(counts.new, 3);
        assert_eq!(counts.in_progress, 0);

        assert_eq!(maintenance.cleanup().await.unwrap(), 0);
        assert_eq!(maintenance.status_counts().await.unwrap(), counts);

        let reset = store.pop_task(&PopFilter::default()).await.unwrap().unwrap();
        assert!(reset.terminated_at.is_none());
    }

    #[tokio::test]
    async fn test_reset_task() {
        let store = store().await;
        let task = store.insert_task(&NewTask::new("bad")).await.unwrap();
        store.pop_task(&PopFilter::default()).await.unwrap();
        store.mark_failed(task.id, "bad things happened").await.unwrap();

        let maintenance = Maintenance::new(store.clone());
        maintenance.reset_task(task.id).await.unwrap();

        let reset = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(reset.status, TaskStatus::New);
        assert!(reset.started_at.is_none());
        assert!(reset.terminated_at.is_none());
        assert_eq!(reset.fail_reason.as_deref(), Some("bad things happened"));

        // Already `new`
        assert!(matches!(
            maintenance.reset_task(task.id).await,
            Err(RowqError::TaskNotFound(_))
        ));
        assert!(matches!(
            maintenance.reset_task(TaskId(404)).await,
            Err(RowqError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let store = store().await;
        let client = Client::new(store.clone());
        client.enqueue("awesome", &serde_json::json!({})).await.unwrap();
        client.enqueue("bad", &serde_json::json!({})).await.unwrap();
        client.enqueue("awesome", &serde_json::json!({})).await.unwrap();

        worker(&store, PopFilter::new().include_types(["bad"]), 1)
            .run(&mut TaskContext::new())
            .await
            .unwrap();
        store.pop_task(&PopFilter::default()).await.unwrap();

        let counts = client.status_counts().await.unwrap();
        assert_eq!(counts.new, 1);
        assert_eq!(counts.in_progress, 1);
        assert_eq!(counts.success, 0);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.total(), 3);
    }

    // ========== Pool ==========

    #[tokio::test]
    async fn test_pool_cleans_up_then_drains_queue() {
        let store = store().await;
        let client = Client::new(store.clone());
        for _ in 0..5 {
            client.enqueue("awesome", &serde_json::json!({})).await.unwrap();
        }
        // Claimed by a worker that never finished
        store.pop_task(&PopFilter::default()).await.unwrap();

        let config = WorkerConfig::builder()
            .namespace("test")
            .num_workers(2)
            .poll_gap(Duration::from_millis(1))
            .tries(3)
            .cleanup_on_start(true)
            .build();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let pool = WorkerPool::new(
            config,
            store.clone(),
            TaskRegistry::new()
                .with(Recorder { seen: seen.clone() })
                .unwrap(),
        );

        let stats = pool.run_until(std::future::pending::<()>()).await.unwrap();
        assert_eq!(stats.cleaned_up, 1);
        assert_eq!(stats.totals.succeeded, 5);
        assert_eq!(stats.totals.executed(), 5);
        assert_eq!(stats.totals.missing, 0);
        assert_eq!(stats.totals.polls, 6);
        assert_eq!(stats.crashed_workers, 0);
        assert_eq!(client.status_counts().await.unwrap().success, 5);

        // Each task ran exactly once across both workers
        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 5);
        assert_eq!(unique.len(), 5);
    }

    #[tokio::test]
    async fn test_pool_stops_on_shutdown_signal() {
        let store = store().await;
        let config = WorkerConfig::builder()
            .namespace("test")
            .num_workers(3)
            .poll_gap(Duration::from_secs(3600))
            .shutdown_timeout(Duration::from_secs(5))
            .build();
        let pool = WorkerPool::new(config, store, TaskRegistry::new().with(Awesome).unwrap());

        let stats = tokio::time::timeout(
            Duration::from_secs(10),
            pool.run_until(tokio::time::sleep(Duration::from_millis(50))),
        )
        .await
        .expect("pool did not stop")
        .unwrap();
        assert_eq!(stats.totals.polls, 3);
        assert_eq!(stats.crashed_workers, 0);
    }

    #[tokio::test]
    async fn test_pool_rejects_zero_workers() {
        let store = store().await;
        let config = WorkerConfig::builder()
            .namespace("test")
            .num_workers(0)
            .build();
        let pool = WorkerPool::new(config, store, TaskRegistry::new().with(Awesome).unwrap());
        assert!(matches!(
            pool.run_until(std::future::pending::<()>()).await,
            Err(RowqError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_rejects_namespace_of_another_table() {
        let store = store().await;
        store.insert_task(&NewTask::new("awesome")).await.unwrap();

        let config = WorkerConfig::from_lookup(|key| match key {
            "ROWQ_NAMESPACE" => Some("billing".to_string()),
            "ROWQ_WORKERS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap();
        let pool = WorkerPool::new(
            config,
            store.clone(),
            TaskRegistry::new().with(Awesome).unwrap(),
        );

        let err = pool
            .run_until(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(matches!(err, RowqError::Config(ref msg) if msg.contains("billing_tasks")));
        assert_eq!(store.status_counts().await.unwrap().new, 1);
    }

    #[tokio::test]
    async fn test_concurrent_pops_on_shared_file_claim_each_task_once() {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("rowq_race_{}.db", nanos));

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .unwrap();
        let store = SqliteStore::from_pool(pool, "race").unwrap();
        store.init_schema().await.unwrap();

        for _ in 0..10 {
            store.insert_task(&NewTask::new("awesome")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..40 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.pop_task(&PopFilter::default()).await.unwrap()
            }));
        }

        let mut claimed = HashSet::new();
        for handle in handles {
            if let Some(task) = handle.await.unwrap() {
                assert!(claimed.insert(task.id), "task {} claimed twice", task.id);
            }
        }

        let counts = store.status_counts().await.unwrap();
        assert_eq!(claimed.len(), 10);
        assert_eq!(counts.in_progress, claimed.len() as u64);
        assert_eq!(counts.new, 0);

        store.pool().close().await;
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.clone().into_os_string();
            file.push(suffix);
            std::fs::remove_file(file).ok();
        }
    }

    #[tokio::test]
    async fn test_namespaces_are_separate_tables() {
        let store = store().await;
        let other = SqliteStore::with_pool(store.pool().clone(), "other")
            .await
            .unwrap();
        assert_eq!(other.table(), "other_tasks");

        store.insert_task(&NewTask::new("awesome")).await.unwrap();
        assert_eq!(other.status_counts().await.unwrap().total(), 0);
        assert!(other.pop_task(&PopFilter::default()).await.unwrap().is_none());
    }
}

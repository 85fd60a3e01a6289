//! PostgreSQL task store for rowq.
//!
//! Claims use a blocking `FOR UPDATE` row lock by default: a second worker
//! selecting the same row waits until the first commits, then sees the row
//! is no longer eligible. `PopFilter::skip_locked` switches to
//! `FOR UPDATE SKIP LOCKED`, which skips the contended row instead.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rowq_postgres::PostgresStore;
//! use rowq_core::Client;
//!
//! #[tokio::main]
//! async fn main() -> rowq_core::Result<()> {
//!     let store = PostgresStore::new("postgres://localhost/mydb", "myapp").await?;
//!     let client = Client::new(store);
//!     client.enqueue("send_email", &serde_json::json!({ "to": "a@example.com" })).await?;
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};

use rowq_core::{
    tasks_table, NewTask, PopFilter, Result, RowqError, StatusCounts, Task, TaskId, TaskStatus,
    TaskStore,
};

/// A transaction on the task database.
pub type PgSession = Transaction<'static, Postgres>;

const TASK_COLUMNS: &str =
    r#"id, priority, status, fail_reason, started_at, terminated_at, created_at, "type", payload"#;

type TaskRow = (
    i64,
    i32,
    String,
    Option<String>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    DateTime<Utc>,
    String,
    String,
);

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
        started_at,
        terminated_at,
        created_at,
        kind,
        payload: serde_json::from_str(&payload)?,
    })
}

/// Append the pop filter's conditions to `qb`.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &PopFilter) {
    qb.push("status IN (");
    let mut statuses = qb.separated(", ");
    for status in filter.status_values() {
        statuses.push_bind(status);
    }
    statuses.push_unseparated(")");

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

/// PostgreSQL store for the task table.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
}

impl PostgresStore {
    /// Connect to PostgreSQL and create the task table if needed.
    pub async fn new(database_url: &str, namespace: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to connect to PostgreSQL: {}", e)))?;

        let store = Self::from_pool(pool, namespace)?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The schema is not touched.
    pub fn from_pool(pool: PgPool, namespace: &str) -> Result<Self> {
        Ok(Self {
            pool,
            table: tasks_table(namespace)?,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    type Session = PgSession;

    fn table(&self) -> &str {
        &self.table
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGSERIAL PRIMARY KEY,
                priority INTEGER NOT NULL DEFAULT 50,
                status TEXT NOT NULL DEFAULT 'new'
                    CHECK (status IN ('new', 'in_progress', 'success', 'failed')),
                fail_reason TEXT,
                started_at TIMESTAMPTZ,
                terminated_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
                "type" TEXT NOT NULL,
                payload TEXT NOT NULL DEFAULT '{{}}'
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to create tasks table: {}", e)))?;

        // Matches the pop ordering
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
            INSERT INTO {} (priority, status, "type", payload)
            VALUES ($1, 'new', $2, $3)
            RETURNING {}
            "#,
            self.table, TASK_COLUMNS
        ))
        .bind(task.priority)
        .bind(&task.kind)
        .bind(task.payload_json()?)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to insert task: {}", e)))?;

        task_from_row(row)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = $1",
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

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to begin pop: {}", e)))?;

        // Locking read of the best candidate, then a conditional update of
        // exactly that row, in one statement.
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "WITH next AS (SELECT id FROM {} WHERE ",
            self.table
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY priority DESC, created_at ASC, id ASC LIMIT 1 FOR UPDATE");
        if filter.skip_locked {
            qb.push(" SKIP LOCKED");
        }
        qb.push(format!(
            ") UPDATE {} AS t SET status = 'in_progress', started_at = clock_timestamp(), \
             terminated_at = NULL FROM next WHERE t.id = next.id AND t.status IN (",
            self.table
        ));
        let mut statuses = qb.separated(", ");
        for status in filter.status_values() {
            statuses.push_bind(status);
        }
        statuses.push_unseparated(") RETURNING t.id");

        let claimed: Option<(i64,)> = qb
            .build_query_as()
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to pop task: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to commit pop: {}", e)))?;

        match claimed {
            Some((id,)) => self.get_task(TaskId(id)).await,
            None => Ok(None),
        }
    }

    async fn begin(&self) -> Result<PgSession> {
        self.pool
            .begin()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to begin transaction: {}", e)))
    }

    async fn commit(&self, session: PgSession) -> Result<()> {
        session
            .commit()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to commit: {}", e)))
    }

    async fn rollback(&self, session: PgSession) -> Result<()> {
        session
            .rollback()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to roll back: {}", e)))
    }

    async fn fetch_in_session(&self, session: &mut PgSession, id: TaskId) -> Result<Option<Task>> {
        // The row lock is held until the execution commits, which keeps
        // cleanup (SKIP LOCKED) away from running tasks.
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {} FROM {} WHERE id = $1 FOR UPDATE",
            TASK_COLUMNS, self.table
        ))
        .bind(id.0)
        .fetch_optional(&mut **session)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to fetch task: {}", e)))?;

        row.map(task_from_row).transpose()
    }

    async fn mark_succeeded(&self, session: &mut PgSession, id: TaskId) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE {} SET status = 'success', terminated_at = clock_timestamp() WHERE id = $1",
            self.table
        ))
        .bind(id.0)
        .execute(&mut **session)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to mark task succeeded: {}", e)))?;
        Ok(())
    }

    async fn mark_failed(&self, id: TaskId, reason: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'failed', fail_reason = $2, terminated_at = clock_timestamp() \
             WHERE id = $1",
            self.table
        ))
        .bind(id.0)
        .bind(reason)
        .execute(&self.pool)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to mark task failed: {}", e)))?;

        if result.rows_affected() == 0 {
            tracing::warn!(task_id = %id, "Failed task vanished before its failure was recorded");
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to begin cleanup: {}", e)))?;

        // Rows locked by a live execution are skipped: only orphans are reset.
        let result = sqlx::query(&format!(
            r#"
            WITH orphaned AS (
                SELECT id FROM {} WHERE status = 'in_progress' FOR UPDATE SKIP LOCKED
            )
            UPDATE {} AS t SET status = 'new', started_at = NULL, terminated_at = NULL
            FROM orphaned WHERE t.id = orphaned.id
            "#,
            self.table, self.table
        ))
        .execute(&mut *tx)
        .await
        .map_err(|e| RowqError::Backend(format!("Failed to clean up tasks: {}", e)))?;

        tx.commit()
            .await
            .map_err(|e| RowqError::Backend(format!("Failed to commit cleanup: {}", e)))?;

        Ok(result.rows_affected())
    }

    async fn reset_task(&self, id: TaskId) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET status = 'new', started_at = NULL, terminated_at = NULL \
             WHERE id = $1 AND status IN ('in_progress', 'failed')",
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


// ========== Integration Tests (require PostgreSQL) ==========

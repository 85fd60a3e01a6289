//! Basic example using the SQLite in-memory store.
//!
//! This example demonstrates:
//! - Registering task kinds that write through the execution session
//! - Enqueueing tasks with different priorities
//! - Draining the queue with a bounded worker pool
//!
//! Run with: `cargo run -p demo-basic`

use rowq_core::{
    async_trait, Client, PopFilter, Task, TaskContext, TaskError, TaskKind, TaskRegistry,
    TaskResult, WorkerConfig, WorkerPool,
};
use rowq_sqlite::{SqliteSession, SqliteStore};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Email notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Email {
    to: String,
    subject: String,
}

struct SendEmail;

#[async_trait]
impl TaskKind<SqliteSession> for SendEmail {
    fn kind(&self) -> &'static str {
        "send_email"
    }

    async fn run(
        &self,
        task: &Task,
        ctx: &mut TaskContext,
        session: &mut SqliteSession,
    ) -> TaskResult {
        let email: Email = task.payload_as()?;
        println!("[email] priority {} -> {}: {}", task.priority, email.to, email.subject);

        // Simulate some work
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Committed only if the task succeeds
        sqlx::query("INSERT INTO outbox (recipient) VALUES (?)")
            .bind(&email.to)
            .execute(&mut **session)
            .await?;

        ctx.increment("emails_sent");
        Ok(())
    }
}

struct ChargeCard;

#[async_trait]
impl TaskKind<SqliteSession> for ChargeCard {
    fn kind(&self) -> &'static str {
        "charge_card"
    }

    async fn run(
        &self,
        _task: &Task,
        _ctx: &mut TaskContext,
        _session: &mut SqliteSession,
    ) -> TaskResult {
        Err(TaskError::new("card declined"))
    }
}

#[tokio::main]
async fn main() -> rowq_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("rowq task queue example\n");

    let store = SqliteStore::in_memory("demo").await?;
    sqlx::query("CREATE TABLE outbox (recipient TEXT NOT NULL)")
        .execute(store.pool())
        .await
        .map_err(|e| rowq_core::RowqError::Backend(e.to_string()))?;

    let client = Client::new(store.clone());

    let emails = [
        ("alice@example.com", "Weekly digest", 10),
        ("bob@example.com", "Password reset", 90),
        ("charlie@example.com", "Your order shipped", 50),
    ];
    for (to, subject, priority) in emails {
        let email = Email {
            to: to.to_string(),
            subject: subject.to_string(),
        };
        let id = client
            .enqueue_with_priority("send_email", &email, priority)
            .await?;
        println!("Enqueued task {} (priority {})", id, priority);
    }
    let charge = client
        .enqueue("charge_card", &serde_json::json!({ "amount_cents": 1299 }))
        .await?;
    println!("Enqueued task {}\n", charge);

    let registry = TaskRegistry::new().with(SendEmail)?.with(ChargeCard)?;

    let config = WorkerConfig::builder()
        .namespace("demo")
        .num_workers(1)
        .poll_gap(Duration::from_millis(10))
        .filter(PopFilter::default())
        .tries(5)
        .build();

    let pool = WorkerPool::new(config, store.clone(), registry);
    let stats = pool.run().await?;
    tracing::info!(stats = ?stats, "Worker pool finished");

    println!(
        "\nDone: {} succeeded, {} failed over {} polls",
        stats.totals.succeeded, stats.totals.failed, stats.totals.polls
    );

    if let Some(task) = client.get(charge).await? {
        println!(
            "charge_card task {} is {} ({})",
            task.id,
            task.status,
            task.fail_reason.unwrap_or_default()
        );
    }

    let counts = client.status_counts().await?;
    println!(
        "new={} in_progress={} success={} failed={}",
        counts.new, counts.in_progress, counts.success, counts.failed
    );

    Ok(())
}

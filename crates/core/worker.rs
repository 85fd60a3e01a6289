//! Worker loop: poll, claim, execute, sleep.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::context::{TaskContext, POLLS_KEY, WORKER_ID_KEY};
use crate::error::Result;
use crate::executor::{Executor, Outcome};
use crate::filter::PopFilter;
use crate::kind::TaskRegistry;
use crate::store::TaskStore;

/// Counters for one worker's run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Pop attempts, including empty ones.
    pub polls: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Claimed tasks whose row was gone by execution time.
    pub missing: usize,
}

impl WorkerStats {
    /// Tasks claimed and executed.
    pub fn executed(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn merge(&mut self, other: &WorkerStats) {
        self.polls += other.polls;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.missing += other.missing;
    }
}

/// A single polling worker.
///
/// Task-body failures are recorded on the task and the loop continues.
/// Store errors end the loop and are returned to the caller.
pub struct Worker<S: TaskStore> {
    id: usize,
    store: S,
    executor: Executor<S>,
    filter: PopFilter,
    poll_gap: Duration,
    tries: Option<usize>,
    cancel: CancellationToken,
}

impl<S: TaskStore + Clone> Worker<S> {
    pub fn new(
        id: usize,
        store: S,
        registry: Arc<TaskRegistry<S::Session>>,
        filter: PopFilter,
        poll_gap: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            executor: Executor::new(store.clone(), registry),
            store,
            filter,
            poll_gap,
            tries: None,
            cancel,
        }
    }

    /// Stop after `tries` poll attempts.
    pub fn tries(mut self, tries: usize) -> Self {
        self.tries = Some(tries);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run until cancelled or the `tries` budget is spent.
    ///
    /// `ctx` is seeded with the worker id under [`WORKER_ID_KEY`] and counts
    /// poll attempts under [`POLLS_KEY`], so task bodies can read both.
    pub async fn run(&self, ctx: &mut TaskContext) -> Result<WorkerStats> {
        self.filter.validate()?;
        tracing::debug!(worker_id = self.id, "Worker started");

        ctx.insert(WORKER_ID_KEY, self.id);

        let mut stats = WorkerStats::default();
        let mut remaining = self.tries;

        while !self.cancel.is_cancelled() {
            match remaining.as_mut() {
                Some(0) => break,
                Some(n) => *n -= 1,
                None => {}
            }

            stats.polls += 1;
            ctx.increment(POLLS_KEY);
            match self.run_once(ctx).await {
                Ok(Some(Outcome::Succeeded)) => stats.succeeded += 1,
                Ok(Some(Outcome::Failed { .. })) => stats.failed += 1,
                Ok(Some(Outcome::Missing)) => stats.missing += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        worker_id = self.id,
                        error = %e,
                        "Worker stopped on store error"
                    );
                    return Err(e);
                }
            }

            if remaining == Some(0) {
                break;
            }
            self.pause().await;
        }

        tracing::debug!(
            worker_id = self.id,
            polls = stats.polls,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "Worker stopped"
        );
        Ok(stats)
    }

    /// One iteration: claim a task and execute it.
    ///
    /// Returns `None` when there was nothing to claim.
    pub async fn run_once(&self, ctx: &mut TaskContext) -> Result<Option<Outcome>> {
        let task = match self.store.pop_task(&self.filter).await? {
            Some(task) => task,
            None => return Ok(None),
        };

        tracing::debug!(
            worker_id = self.id,
            task_id = %task.id,
            kind = %task.kind,
            priority = task.priority,
            "Claimed task"
        );

        let outcome = self.executor.execute(task.id, ctx).await?;

        if let Outcome::Failed { reason } = &outcome {
            self.store.mark_failed(task.id, reason).await?;
            tracing::warn!(
                worker_id = self.id,
                task_id = %task.id,
                kind = %task.kind,
                error = %reason,
                "Task failed"
            );
        }

        Ok(Some(outcome))
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.poll_gap) => {}
        }
    }
}

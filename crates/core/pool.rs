//! Worker pool for processing tasks.

use std::future::Future;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::context::TaskContext;
use crate::error::{Result, RowqError};
use crate::kind::TaskRegistry;
use crate::maintenance::Maintenance;
use crate::store::{tasks_table, TaskStore};
use crate::worker::{Worker, WorkerStats};

/// Summary of a pool run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Sum over all workers that stopped normally.
    pub totals: WorkerStats,
    /// Orphaned tasks reset before workers started.
    pub cleaned_up: u64,
    /// Workers that stopped on a store error or panicked.
    pub crashed_workers: usize,
}

/// Runs `num_workers` worker loops against one store.
///
/// Every worker gets its own [`TaskContext`]; they share the store handle
/// (a connection pool) and coordinate only through the task table.
pub struct WorkerPool<S: TaskStore> {
    config: WorkerConfig,
    store: S,
    registry: Arc<TaskRegistry<S::Session>>,
    cancel: CancellationToken,
}

impl<S> WorkerPool<S>
where
    S: TaskStore + Clone + 'static,
    S::Session: 'static,
{
    /// Create a new worker pool with the given configuration, store, and registry.
    pub fn new(config: WorkerConfig, store: S, registry: TaskRegistry<S::Session>) -> Self {
        Self {
            config,
            store,
            registry: Arc::new(registry),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops every worker when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run the pool until Ctrl-C.
    pub async fn run(&self) -> Result<PoolStats> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run the pool until `shutdown` resolves, the cancellation token fires,
    /// or every worker has used up its `tries`.
    ///
    /// Fails with [`RowqError::Config`] when the configured namespace does
    /// not name the store's task table.
    ///
    /// On shutdown, workers finish the task they are executing; any still
    /// running after `shutdown_timeout` are aborted.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<PoolStats>
    where
        F: Future<Output = ()> + Send,
    {
        if self.config.num_workers == 0 {
            return Err(RowqError::Config("num_workers must be at least 1".to_string()));
        }
        self.config.filter.validate()?;

        let expected = tasks_table(&self.config.namespace)?;
        if self.store.table() != expected {
            return Err(RowqError::Config(format!(
                "namespace '{}' uses table '{}', but the store is bound to '{}'",
                self.config.namespace,
                expected,
                self.store.table()
            )));
        }

        let mut stats = PoolStats::default();

        if self.config.cleanup_on_start {
            stats.cleaned_up = Maintenance::new(self.store.clone()).cleanup().await?;
        }

        let mut tasks = JoinSet::new();
        for worker_id in 0..self.config.num_workers {
            let mut worker = Worker::new(
                worker_id,
                self.store.clone(),
                self.registry.clone(),
                self.config.filter.clone(),
                self.config.poll_gap,
                self.cancel.clone(),
            );
            if let Some(tries) = self.config.tries {
                worker = worker.tries(tries);
            }
            tasks.spawn(async move {
                let mut ctx = TaskContext::new();
                worker.run(&mut ctx).await
            });
        }

        tracing::info!(
            workers = self.config.num_workers,
            namespace = %self.config.namespace,
            kinds = ?self.registry.kinds(),
            "Worker pool started"
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, draining...");
                    self.cancel.cancel();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(result) => record(result, &mut stats),
                    None => {
                        tracing::info!("All workers finished");
                        return Ok(stats);
                    }
                },
            }
        }

        let deadline = tokio::time::sleep(self.config.shutdown_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(
                        remaining = tasks.len(),
                        "Shutdown timeout reached, aborting workers"
                    );
                    tasks.shutdown().await;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(result) => record(result, &mut stats),
                    None => break,
                },
            }
        }

        tracing::info!("Worker pool stopped");
        Ok(stats)
    }
}

fn record(result: std::result::Result<Result<WorkerStats>, JoinError>, stats: &mut PoolStats) {
    match result {
        Ok(Ok(worker_stats)) => stats.totals.merge(&worker_stats),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Worker exited with error");
            stats.crashed_workers += 1;
        }
        Err(e) => {
            tracing::error!(error = %e, "Worker panicked");
            stats.crashed_workers += 1;
        }
    }
}

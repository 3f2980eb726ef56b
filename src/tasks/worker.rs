//! Worker pool
//!
//! One dispatcher per process claims ready rows and hands them to N tokio
//! workers over a bounded channel. Several processes may run pools against
//! the same database; claims are atomic per row.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::bounded;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::Instrument;

use super::{ClaimedTask, Resolver, TaskOutcome, TaskQueue};
use crate::config::{TaskRetryPolicy, WorkerConfig};
use crate::context::MirrorContext;
use crate::error::{MirrorError, Result};
use crate::storage::TaskRow;

/// Totals of one pool run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolReport {
    pub completed: usize,
    pub skipped: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Remote create/update calls made by completed tasks
    pub mutations: usize,
}

#[derive(Default)]
struct Counters {
    completed: AtomicUsize,
    skipped: AtomicUsize,
    rescheduled: AtomicUsize,
    failed: AtomicUsize,
    mutations: AtomicUsize,
}

impl Counters {
    fn report(&self) -> PoolReport {
        PoolReport {
            completed: self.completed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            rescheduled: self.rescheduled.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            mutations: self.mutations.load(Ordering::SeqCst),
        }
    }
}

/// Pool of task workers
pub struct WorkerPool {
    resolver: Resolver,
    queue: TaskQueue,
    workers: WorkerConfig,
    retry: TaskRetryPolicy,
    worker_id: String,
}

impl WorkerPool {
    pub fn new(ctx: &MirrorContext) -> Self {
        Self {
            resolver: Resolver::new(ctx),
            queue: ctx.queue(),
            workers: ctx.config.workers.clone(),
            retry: ctx.config.task_retry,
            worker_id: format!("worker-{}", uuid::Uuid::new_v4().simple()),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.workers.concurrency = concurrency.max(1);
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Process tasks until none is pending or running
    pub async fn run_until_idle(&self) -> Result<PoolReport> {
        self.run_inner(true, std::future::pending::<()>()).await
    }

    /// Process tasks until `shutdown` resolves; in-flight tasks finish first
    pub async fn run<F>(&self, shutdown: F) -> Result<PoolReport>
    where
        F: Future<Output = ()>,
    {
        self.run_inner(false, shutdown).await
    }

    async fn run_inner<F>(&self, drain: bool, shutdown: F) -> Result<PoolReport>
    where
        F: Future<Output = ()>,
    {
        let concurrency = self.workers.concurrency.max(1);
        let poll = Duration::from_millis(self.workers.poll_interval_ms.max(1));
        self.queue
            .recover_stale(Duration::from_secs(self.workers.stale_after_secs))?;

        let (sender, receiver) = bounded::<ClaimedTask>(concurrency);
        let counters = Arc::new(Counters::default());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(Notify::new());

        tracing::info!(worker_id = %self.worker_id, concurrency, drain, "Worker pool starting");

        let mut handles = Vec::with_capacity(concurrency);
        for slot in 0..concurrency {
            let receiver = receiver.clone();
            let resolver = self.resolver.clone();
            let queue = self.queue.clone();
            let retry = self.retry;
            let counters = counters.clone();
            let in_flight = in_flight.clone();
            let finished = finished.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(claimed) = receiver.recv().await {
                    process(&resolver, &queue, &retry, claimed, &counters).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    finished.notify_one();
                }
                tracing::debug!(slot, "Worker stopped");
            }));
        }
        drop(receiver);

        tokio::pin!(shutdown);
        let mut outcome = Ok(());
        loop {
            if in_flight.load(Ordering::SeqCst) < concurrency {
                match self.queue.claim(&self.worker_id) {
                    Ok(Some(claimed)) => {
                        in_flight.fetch_add(1, Ordering::SeqCst);
                        if sender.send(claimed).await.is_err() {
                            outcome = Err(MirrorError::Internal("worker channel closed".into()));
                            break;
                        }
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Claim failed, will retry: {}", e);
                    }
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }

            if drain && in_flight.load(Ordering::SeqCst) == 0 {
                match self.queue.stats() {
                    Ok(stats) if stats.outstanding() == 0 => break,
                    Ok(_) => {}
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }

            let wait = match self.queue.next_ready_in() {
                Ok(Some(next)) => next.min(poll),
                Ok(None) => poll,
                Err(_) => poll,
            }
            .max(Duration::from_millis(1));

            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(worker_id = %self.worker_id, "Shutdown requested");
                    break;
                }
                _ = finished.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }

        sender.close();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Worker task panicked: {}", e);
            }
        }

        let report = counters.report();
        tracing::info!(
            completed = report.completed,
            skipped = report.skipped,
            rescheduled = report.rescheduled,
            failed = report.failed,
            mutations = report.mutations,
            "Worker pool stopped"
        );
        outcome.map(|_| report)
    }
}

async fn process(
    resolver: &Resolver,
    queue: &TaskQueue,
    retry: &TaskRetryPolicy,
    claimed: ClaimedTask,
    counters: &Counters,
) {
    let ClaimedTask { row, task } = claimed;
    let span = tracing::info_span!("task", task_id = row.id, task = %task, retries = row.retries);
    let result = resolver.execute(&task).instrument(span).await;
    let recorded = match result {
        Ok(TaskOutcome::Completed { mutations }) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
            counters.mutations.fetch_add(mutations, Ordering::SeqCst);
            tracing::debug!(task_id = row.id, task = %task, mutations, "Task completed");
            queue.complete(row.id)
        }
        Ok(TaskOutcome::Skipped(reason)) => {
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(task_id = row.id, task = %task, "Task skipped: {}", reason);
            queue.complete(row.id)
        }
        Ok(TaskOutcome::Deferred(reason)) => {
            retry_later(queue, retry, &row, &reason.to_string(), None, counters)
        }
        Err(e) if e.is_retryable() => retry_later(
            queue,
            retry,
            &row,
            &e.to_string(),
            e.retry_after_secs().map(Duration::from_secs),
            counters,
        ),
        Err(e) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            tracing::error!(task_id = row.id, task = %task, "Task failed: {}", e);
            queue.fail(row.id, &e.to_string())
        }
    };
    if let Err(e) = recorded {
        tracing::error!(task_id = row.id, "Cannot record task result: {}", e);
    }
}

fn retry_later(
    queue: &TaskQueue,
    retry: &TaskRetryPolicy,
    row: &TaskRow,
    reason: &str,
    hint: Option<Duration>,
    counters: &Counters,
) -> Result<()> {
    if retry.is_exhausted(row.retries) {
        counters.failed.fetch_add(1, Ordering::SeqCst);
        tracing::error!(
            task_id = row.id,
            task_name = %row.task_name,
            retries = row.retries,
            "Retry budget exhausted: {}",
            reason
        );
        return queue.fail(
            row.id,
            &format!("retry budget exhausted after {} retries: {}", row.retries, reason),
        );
    }
    let delay = retry.delay_for(row.retries).max(hint.unwrap_or_default());
    counters.rescheduled.fetch_add(1, Ordering::SeqCst);
    tracing::info!(
        task_id = row.id,
        task_name = %row.task_name,
        retries = row.retries,
        delay_ms = delay.as_millis() as u64,
        "Rescheduling: {}",
        reason
    );
    queue.reschedule(row.id, delay, reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MirrorConfig;
    use crate::lock::MemoryTaskLock;
    use crate::remote::MemoryRemote;
    use crate::source::{MemoryContentLocator, MemorySource};
    use crate::storage::Storage;
    use crate::tasks::Task;

    fn context(source: MemorySource) -> MirrorContext {
        let mut config = MirrorConfig::default();
        config.task_retry = TaskRetryPolicy {
            base_delay_ms: 2,
            step_ms: 1,
            max_delay_ms: 10,
            max_retries: 50,
        };
        config.workers.poll_interval_ms = 5;
        MirrorContext::new(
            config,
            Storage::open_in_memory().unwrap(),
            Arc::new(source),
            Arc::new(MemoryContentLocator::new()),
            Arc::new(MemoryRemote::new()),
            Arc::new(MemoryTaskLock::new()),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drains_dependency_chain() {
        let ctx = context(
            MemorySource::new()
                .with_project(1, "Alpha", None)
                .with_folder(5, 1, None, "Specs"),
        );
        ctx.queue()
            .enqueue(&Task::CreateDmsfFolder { folder_id: 5 }, Duration::ZERO)
            .unwrap();

        let report = WorkerPool::new(&ctx).run_until_idle().await.unwrap();
        // basedir, project, project dmsf root, folder
        assert_eq!(report.mutations, 4);
        assert_eq!(report.failed, 0);
        assert!(report.rescheduled >= 1);
        assert_eq!(ctx.queue().stats().unwrap().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_missing_source_row_fails_permanently() {
        let ctx = context(MemorySource::new());
        ctx.queue()
            .enqueue(&Task::CreateProjectFolder { project_id: 99 }, Duration::ZERO)
            .unwrap();
        let report = WorkerPool::new(&ctx).run_until_idle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.rescheduled, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_long_running_pool() {
        let ctx = context(MemorySource::new());
        let pool = WorkerPool::new(&ctx).with_concurrency(2);
        let report = pool
            .run(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(report, PoolReport::default());
    }
}

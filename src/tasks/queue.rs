//! Typed facade over the durable task table

use std::time::Duration;

use chrono::Utc;

use super::Task;
use crate::error::Result;
use crate::storage::{queue, QueueStats, Storage, TaskRow, TaskStatus};

/// A claimed row together with its decoded task
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub row: TaskRow,
    pub task: Task,
}

fn millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}

/// Task queue shared by every worker attached to the same database
#[derive(Clone)]
pub struct TaskQueue {
    storage: Storage,
}

impl TaskQueue {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Enqueue unconditionally, runnable after `delay`
    pub fn enqueue(&self, task: &Task, delay: Duration) -> Result<i64> {
        let args = task.args_json()?;
        let dedup_key = task.lock_key()?;
        let not_before = Utc::now().timestamp_millis().saturating_add(millis(delay));
        let id = self.storage.with_connection(|conn| {
            queue::insert_task(conn, task.name(), &args, &dedup_key, not_before)
        })?;
        tracing::debug!(task_id = id, task = %task, "Task enqueued");
        Ok(id)
    }

    /// Enqueue unless the same task is already pending or running
    pub fn enqueue_unique(&self, task: &Task) -> Result<Option<i64>> {
        let args = task.args_json()?;
        let dedup_key = task.lock_key()?;
        let now = Utc::now().timestamp_millis();
        let id = self.storage.with_connection(|conn| {
            queue::insert_task_unique(conn, task.name(), &args, &dedup_key, now)
        })?;
        match id {
            Some(id) => tracing::debug!(task_id = id, task = %task, "Task enqueued"),
            None => tracing::trace!(task = %task, "Task already queued"),
        }
        Ok(id)
    }

    /// Claim the earliest ready row. Rows whose arguments no longer decode
    /// are failed on the spot and skipped.
    pub fn claim(&self, worker: &str) -> Result<Option<ClaimedTask>> {
        loop {
            let now = Utc::now().timestamp_millis();
            let Some(row) = self
                .storage
                .with_connection(|conn| queue::claim_next(conn, worker, now))?
            else {
                return Ok(None);
            };
            match Task::from_parts(&row.task_name, &row.args) {
                Ok(task) => return Ok(Some(ClaimedTask { row, task })),
                Err(e) => {
                    tracing::error!(task_id = row.id, task_name = %row.task_name, "Undecodable task: {}", e);
                    self.fail(row.id, &e.to_string())?;
                }
            }
        }
    }

    pub fn complete(&self, id: i64) -> Result<()> {
        self.storage.with_connection(|conn| queue::mark_done(conn, id))
    }

    /// Back to pending after `delay`, consuming one retry
    pub fn reschedule(&self, id: i64, delay: Duration, reason: &str) -> Result<()> {
        let not_before = Utc::now().timestamp_millis().saturating_add(millis(delay));
        self.storage
            .with_connection(|conn| queue::reschedule(conn, id, not_before, reason))
    }

    pub fn fail(&self, id: i64, error: &str) -> Result<()> {
        self.storage
            .with_connection(|conn| queue::mark_failed(conn, id, error))
    }

    /// Return tasks left `running` by a dead worker
    pub fn recover_stale(&self, older_than: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let recovered = self
            .storage
            .with_connection(|conn| queue::recover_stale(conn, cutoff))?;
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered stale running tasks");
        }
        Ok(recovered)
    }

    pub fn list_failed(&self, limit: i64) -> Result<Vec<TaskRow>> {
        self.storage
            .with_connection(|conn| queue::list_by_status(conn, TaskStatus::Failed, limit))
    }

    pub fn requeue_failed(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        self.storage
            .with_connection(|conn| queue::requeue_failed(conn, now))
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.storage.with_connection(queue::queue_stats)
    }

    /// Time until the next pending task becomes ready, if any is pending
    pub fn next_ready_in(&self) -> Result<Option<Duration>> {
        let next = self.storage.with_connection(queue::next_ready_at)?;
        let now = Utc::now().timestamp_millis();
        Ok(next.map(|at| Duration::from_millis(u64::try_from(at - now).unwrap_or(0))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> TaskQueue {
        TaskQueue::new(Storage::open_in_memory().unwrap())
    }

    #[test]
    fn test_enqueue_unique_respects_owner() {
        let q = queue();
        let task = Task::CreateProjectFolder { project_id: 1 };
        assert!(q.enqueue_unique(&task).unwrap().is_some());
        assert!(q.enqueue_unique(&task).unwrap().is_none());

        // Still owned while running
        let claimed = q.claim("w1").unwrap().unwrap();
        assert_eq!(claimed.task, task);
        assert!(q.enqueue_unique(&task).unwrap().is_none());

        q.complete(claimed.row.id).unwrap();
        assert!(q.enqueue_unique(&task).unwrap().is_some());
    }

    #[test]
    fn test_delayed_tasks_are_not_claimed_early() {
        let q = queue();
        q.enqueue(&Task::CreateBasedir, Duration::from_secs(60)).unwrap();
        assert!(q.claim("w1").unwrap().is_none());
        let wait = q.next_ready_in().unwrap().unwrap();
        assert!(wait > Duration::from_secs(50));
    }

    #[test]
    fn test_reschedule_counts_retries() {
        let q = queue();
        q.enqueue(&Task::CreateBasedir, Duration::ZERO).unwrap();
        let claimed = q.claim("w1").unwrap().unwrap();
        q.reschedule(claimed.row.id, Duration::ZERO, "lock busy").unwrap();
        let again = q.claim("w1").unwrap().unwrap();
        assert_eq!(again.row.retries, 1);
        assert_eq!(again.row.last_error.as_deref(), Some("lock busy"));

        q.fail(again.row.id, "gave up").unwrap();
        assert_eq!(q.list_failed(10).unwrap().len(), 1);
        assert_eq!(q.requeue_failed().unwrap(), 1);
        assert_eq!(q.claim("w1").unwrap().unwrap().row.retries, 0);
    }

    #[test]
    fn test_undecodable_rows_are_failed() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| queue::insert_task(conn, "unknown_task", "{}", "k", 0))
            .unwrap();
        let q = TaskQueue::new(storage);
        q.enqueue(&Task::SeedTree, Duration::ZERO).unwrap();

        let claimed = q.claim("w1").unwrap().unwrap();
        assert_eq!(claimed.task, Task::SeedTree);
        assert_eq!(q.stats().unwrap().failed, 1);
    }

    #[test]
    fn test_recover_stale() {
        let q = queue();
        q.enqueue(&Task::CreateBasedir, Duration::ZERO).unwrap();
        q.claim("crashed").unwrap().unwrap();
        assert_eq!(q.recover_stale(Duration::from_secs(3600)).unwrap(), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.recover_stale(Duration::ZERO).unwrap(), 1);
        assert_eq!(q.stats().unwrap().pending, 1);
    }
}

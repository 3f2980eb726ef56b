//! Durable task queue table
//!
//! Rows move `pending -> running -> done | failed`; a reschedule moves a
//! running row back to `pending` with a later `not_before_ms` and one more
//! retry on its counter.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Task row status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Raw queue row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: i64,
    pub task_name: String,
    pub args: String,
    pub status: TaskStatus,
    pub retries: u32,
    pub not_before_ms: i64,
    pub last_error: Option<String>,
}

/// Counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

impl QueueStats {
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running
    }
}

fn row_to_task(row: &Row) -> rusqlite::Result<TaskRow> {
    let status: String = row.get("status")?;
    Ok(TaskRow {
        id: row.get("id")?,
        task_name: row.get("task_name")?,
        args: row.get("args")?,
        status: status.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        retries: row.get("retries")?,
        not_before_ms: row.get("not_before_ms")?,
        last_error: row.get("last_error")?,
    })
}

const TASK_COLUMNS: &str = "id, task_name, args, status, retries, not_before_ms, last_error";

/// Insert a pending task
pub fn insert_task(
    conn: &Connection,
    task_name: &str,
    args: &str,
    dedup_key: &str,
    not_before_ms: i64,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO task_queue (task_name, args, dedup_key, status, retries, not_before_ms, enqueued_at)
         VALUES (?, ?, ?, 'pending', 0, ?, ?)",
        params![task_name, args, dedup_key, not_before_ms, Utc::now().to_rfc3339()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Insert a pending task unless an identical one is pending or running.
///
/// Returns the new row id, or `None` when the task is already owned.
pub fn insert_task_unique(
    conn: &Connection,
    task_name: &str,
    args: &str,
    dedup_key: &str,
    not_before_ms: i64,
) -> Result<Option<i64>> {
    let changed = conn.execute(
        "INSERT INTO task_queue (task_name, args, dedup_key, status, retries, not_before_ms, enqueued_at)
         SELECT ?1, ?2, ?3, 'pending', 0, ?4, ?5
         WHERE NOT EXISTS (
            SELECT 1 FROM task_queue
            WHERE dedup_key = ?3 AND status IN ('pending', 'running')
         )",
        params![task_name, args, dedup_key, not_before_ms, Utc::now().to_rfc3339()],
    )?;
    if changed == 1 {
        Ok(Some(conn.last_insert_rowid()))
    } else {
        Ok(None)
    }
}

/// Atomically move the earliest ready task to `running`
pub fn claim_next(conn: &Connection, worker: &str, now_ms: i64) -> Result<Option<TaskRow>> {
    let sql = format!(
        "UPDATE task_queue
         SET status = 'running', started_at = ?1, worker = ?2
         WHERE id = (
            SELECT id FROM task_queue
            WHERE status = 'pending' AND not_before_ms <= ?3
            ORDER BY not_before_ms, id
            LIMIT 1
         )
         RETURNING {}",
        TASK_COLUMNS
    );
    let row = conn
        .query_row(
            &sql,
            params![Utc::now().to_rfc3339(), worker, now_ms],
            row_to_task,
        )
        .optional()?;
    Ok(row)
}

fn expect_one(changed: usize, id: i64, action: &str) -> Result<()> {
    if changed == 1 {
        Ok(())
    } else {
        Err(MirrorError::Queue(format!(
            "Cannot {} task {}: not running",
            action, id
        )))
    }
}

pub fn mark_done(conn: &Connection, id: i64) -> Result<()> {
    let changed = conn.execute(
        "UPDATE task_queue SET status = 'done', completed_at = ?, last_error = NULL
         WHERE id = ? AND status = 'running'",
        params![Utc::now().to_rfc3339(), id],
    )?;
    expect_one(changed, id, "complete")
}

/// Return a running task to `pending`, bumping its retry counter
pub fn reschedule(conn: &Connection, id: i64, not_before_ms: i64, reason: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE task_queue
         SET status = 'pending', retries = retries + 1, not_before_ms = ?, last_error = ?,
             worker = NULL
         WHERE id = ? AND status = 'running'",
        params![not_before_ms, reason, id],
    )?;
    expect_one(changed, id, "reschedule")
}

pub fn mark_failed(conn: &Connection, id: i64, error: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE task_queue SET status = 'failed', completed_at = ?, last_error = ?
         WHERE id = ? AND status = 'running'",
        params![Utc::now().to_rfc3339(), error, id],
    )?;
    expect_one(changed, id, "fail")
}

/// Reset `running` tasks claimed before `started_before` back to `pending`
pub fn recover_stale(conn: &Connection, started_before: chrono::DateTime<Utc>) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE task_queue SET status = 'pending', worker = NULL
         WHERE status = 'running' AND started_at < ?",
        params![started_before.to_rfc3339()],
    )?;
    Ok(changed)
}

pub fn list_by_status(conn: &Connection, status: TaskStatus, limit: i64) -> Result<Vec<TaskRow>> {
    let sql = format!(
        "SELECT {} FROM task_queue WHERE status = ? ORDER BY id LIMIT ?",
        TASK_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![status.as_str(), limit], row_to_task)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Move failed tasks back to `pending` with a fresh retry budget
pub fn requeue_failed(conn: &Connection, now_ms: i64) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE task_queue
         SET status = 'pending', retries = 0, not_before_ms = ?, completed_at = NULL, worker = NULL
         WHERE status = 'failed'",
        params![now_ms],
    )?;
    Ok(changed)
}

/// Earliest `not_before_ms` among pending tasks
pub fn next_ready_at(conn: &Connection) -> Result<Option<i64>> {
    let next: Option<i64> = conn.query_row(
        "SELECT MIN(not_before_ms) FROM task_queue WHERE status = 'pending'",
        [],
        |row| row.get(0),
    )?;
    Ok(next)
}

pub fn queue_stats(conn: &Connection) -> Result<QueueStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM task_queue GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut stats = QueueStats::default();
    for row in rows {
        let (status, count) = row?;
        match status.parse::<TaskStatus>() {
            Ok(TaskStatus::Pending) => stats.pending = count,
            Ok(TaskStatus::Running) => stats.running = count,
            Ok(TaskStatus::Done) => stats.done = count,
            Ok(TaskStatus::Failed) => stats.failed = count,
            Err(e) => tracing::warn!("Ignoring queue row: {}", e),
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    #[test]
    fn test_claim_order_and_readiness() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let late = insert_task(conn, "b", "{}", "kb", 500)?;
                let early = insert_task(conn, "a", "{}", "ka", 100)?;

                assert!(claim_next(conn, "w1", 50)?.is_none());

                let first = claim_next(conn, "w1", 1_000)?.unwrap();
                assert_eq!(first.id, early);
                assert_eq!(first.status, TaskStatus::Running);

                let second = claim_next(conn, "w2", 1_000)?.unwrap();
                assert_eq!(second.id, late);

                assert!(claim_next(conn, "w3", 1_000)?.is_none());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_unique_insert_respects_owner() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                assert!(insert_task_unique(conn, "a", "{}", "k", 0)?.is_some());
                assert!(insert_task_unique(conn, "a", "{}", "k", 0)?.is_none());

                // Still owned while running
                let row = claim_next(conn, "w", 10)?.unwrap();
                assert!(insert_task_unique(conn, "a", "{}", "k", 0)?.is_none());

                // Finished tasks do not block a new one
                mark_done(conn, row.id)?;
                assert!(insert_task_unique(conn, "a", "{}", "k", 0)?.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_reschedule_and_fail() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                let id = insert_task(conn, "a", "{}", "k", 0)?;
                claim_next(conn, "w", 0)?.unwrap();
                reschedule(conn, id, 200, "dependency not ready")?;

                assert!(claim_next(conn, "w", 100)?.is_none());
                let row = claim_next(conn, "w", 200)?.unwrap();
                assert_eq!(row.retries, 1);
                assert_eq!(row.last_error.as_deref(), Some("dependency not ready"));

                mark_failed(conn, id, "gave up")?;
                // Not running anymore
                assert!(matches!(mark_done(conn, id), Err(MirrorError::Queue(_))));

                let stats = queue_stats(conn)?;
                assert_eq!(stats.failed, 1);
                assert_eq!(stats.outstanding(), 0);

                assert_eq!(requeue_failed(conn, 0)?, 1);
                let row = claim_next(conn, "w", 0)?.unwrap();
                assert_eq!(row.retries, 0);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_recover_stale() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                insert_task(conn, "a", "{}", "k", 0)?;
                claim_next(conn, "crashed", 0)?.unwrap();

                let recovered = recover_stale(conn, Utc::now() + chrono::Duration::seconds(1))?;
                assert_eq!(recovered, 1);
                assert!(claim_next(conn, "w", 0)?.is_some());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_next_ready_at() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .with_connection(|conn| {
                assert_eq!(next_ready_at(conn)?, None);
                insert_task(conn, "a", "{}", "k1", 300)?;
                insert_task(conn, "a", "{}", "k2", 200)?;
                assert_eq!(next_ready_at(conn)?, Some(200));
                Ok(())
            })
            .unwrap();
    }
}

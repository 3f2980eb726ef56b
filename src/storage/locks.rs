//! Expiring task lock rows

use rusqlite::{params, Connection};

use crate::error::Result;

/// Take the lock if it is free or expired. Returns true when held.
pub fn try_lock(
    conn: &Connection,
    lock_key: &str,
    owner: &str,
    now_ms: i64,
    ttl_ms: i64,
) -> Result<bool> {
    let changed = conn.execute(
        "INSERT INTO task_locks (lock_key, owner, expires_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(lock_key) DO UPDATE
            SET owner = excluded.owner, expires_at_ms = excluded.expires_at_ms
            WHERE task_locks.expires_at_ms <= ?4",
        params![lock_key, owner, now_ms.saturating_add(ttl_ms), now_ms],
    )?;
    Ok(changed == 1)
}

/// Push the expiry of a lock still held by `owner`. Returns false once it was taken over.
pub fn renew(conn: &Connection, lock_key: &str, owner: &str, now_ms: i64, ttl_ms: i64) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE task_locks SET expires_at_ms = ?1 WHERE lock_key = ?2 AND owner = ?3",
        params![now_ms.saturating_add(ttl_ms), lock_key, owner],
    )?;
    Ok(changed == 1)
}

/// Release a lock held by `owner`; a lock taken over after expiry is left alone
pub fn unlock(conn: &Connection, lock_key: &str, owner: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM task_locks WHERE lock_key = ? AND owner = ?",
        params![lock_key, owner],
    )?;
    Ok(changed == 1)
}

/// Drop expired rows
pub fn purge_expired(conn: &Connection, now_ms: i64) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM task_locks WHERE expires_at_ms <= ?",
        params![now_ms],
    )?)
}

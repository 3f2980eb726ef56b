//! Non-blocking per-task mutual exclusion
//!
//! A lock is keyed by task identity and expires on its own, so a crashed
//! worker never wedges an entity. A live holder renews its lease while it
//! works. Acquisition never waits: `Busy` is returned immediately and the
//! caller reschedules.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::{locks, Storage};

/// Outcome of a lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Held,
    Busy,
}

/// Distributed task lock
pub trait TaskLock: Send + Sync {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockStatus>;

    /// Extend a lock `owner` still holds; false when it expired and was taken over
    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;

    fn release(&self, key: &str, owner: &str) -> Result<()>;
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

/// Stable lock key: `<task_name>-lock-<sha256(args)>`
pub fn task_lock_key(task_name: &str, args: &str) -> String {
    let digest = Sha256::digest(args.as_bytes());
    format!("{}-lock-{}", task_name, hex::encode(digest))
}

/// Releases its lock when dropped.
///
/// The lease lasts `ttl` from acquisition or from the last [`renew`](Self::renew).
pub struct TaskLockGuard {
    lock: Arc<dyn TaskLock>,
    key: String,
    owner: String,
    ttl: Duration,
}

impl TaskLockGuard {
    /// Try to take `key`; `None` means another worker holds it
    pub fn acquire(lock: &Arc<dyn TaskLock>, key: String, ttl: Duration) -> Result<Option<Self>> {
        let owner = uuid::Uuid::new_v4().to_string();
        match lock.try_acquire(&key, &owner, ttl)? {
            LockStatus::Held => {
                tracing::debug!(lock_key = %key, "Lock acquired");
                Ok(Some(Self {
                    lock: Arc::clone(lock),
                    key,
                    owner,
                    ttl,
                }))
            }
            LockStatus::Busy => {
                tracing::debug!(lock_key = %key, "Lock busy");
                Ok(None)
            }
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Restart the lease; false means another worker owns the key now
    pub fn renew(&self) -> Result<bool> {
        self.lock.renew(&self.key, &self.owner, self.ttl)
    }
}

impl Drop for TaskLockGuard {
    fn drop(&mut self) {
        match self.lock.release(&self.key, &self.owner) {
            Ok(()) => tracing::debug!(lock_key = %self.key, "Lock released"),
            Err(e) => tracing::warn!(lock_key = %self.key, "Failed to release lock: {}", e),
        }
    }
}

/// Lock rows in the shared SQLite database; safe across worker processes
#[derive(Clone)]
pub struct SqliteTaskLock {
    storage: Storage,
}

impl SqliteTaskLock {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Remove expired lock rows
    pub fn purge_expired(&self) -> Result<usize> {
        let now_ms = Utc::now().timestamp_millis();
        self.storage
            .with_connection(|conn| locks::purge_expired(conn, now_ms))
    }
}

impl TaskLock for SqliteTaskLock {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockStatus> {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = ttl_millis(ttl);
        let held = self
            .storage
            .with_connection(|conn| locks::try_lock(conn, key, owner, now_ms, ttl_ms))?;
        Ok(if held {
            LockStatus::Held
        } else {
            LockStatus::Busy
        })
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        self.storage
            .with_connection(|conn| locks::renew(conn, key, owner, now_ms, ttl_millis(ttl)))
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.storage
            .with_connection(|conn| locks::unlock(conn, key, owner))?;
        Ok(())
    }
}

/// In-process lock table
#[derive(Default)]
pub struct MemoryTaskLock {
    entries: DashMap<String, (String, i64)>,
}

impl MemoryTaskLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn held_count(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        self.entries
            .iter()
            .filter(|entry| entry.value().1 > now_ms)
            .count()
    }
}

impl TaskLock for MemoryTaskLock {
    fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> Result<LockStatus> {
        let now_ms = Utc::now().timestamp_millis();
        let expires_at = now_ms.saturating_add(ttl_millis(ttl));

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| (String::new(), i64::MIN));
        if entry.1 <= now_ms {
            *entry = (owner.to_string(), expires_at);
            Ok(LockStatus::Held)
        } else {
            Ok(LockStatus::Busy)
        }
    }

    fn renew(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now_ms = Utc::now().timestamp_millis();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.0 == owner => {
                entry.1 = now_ms.saturating_add(ttl_millis(ttl));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn release(&self, key: &str, owner: &str) -> Result<()> {
        self.entries
            .remove_if(key, |_, (holder, _)| holder.as_str() == owner);
        Ok(())
    }
}

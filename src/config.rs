//! Configuration for the mirroring engine
//!
//! Every field has a default so a partial TOML file (or none at all) is
//! valid; the binaries layer CLI flags and `TREEMIRROR_*` env vars on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Name of the singleton remote folder holding all projects
    pub basedir_name: String,
    /// Remote id under which the basedir is created
    pub remote_root_id: String,
    /// Name of the per-project documents folder
    pub documents_folder_name: String,
    /// Name of the per-project DMSF root folder
    pub dmsf_folder_name: String,
    pub task_retry: TaskRetryPolicy,
    pub remote_retry: RemoteRetryPolicy,
    /// Expiry of a task lock; a crashed worker's lock self-heals after this
    pub lock_ttl_secs: u64,
    pub workers: WorkerConfig,
    pub content: ContentConfig,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            basedir_name: "Redmine".to_string(),
            remote_root_id: "root".to_string(),
            documents_folder_name: "Documents".to_string(),
            dmsf_folder_name: "DMSF Folders".to_string(),
            task_retry: TaskRetryPolicy::default(),
            remote_retry: RemoteRetryPolicy::default(),
            lock_ttl_secs: 300,
            workers: WorkerConfig::default(),
            content: ContentConfig::default(),
        }
    }
}

impl MirrorConfig {
    /// Load from a TOML file
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: MirrorConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.basedir_name.trim().is_empty() {
            return Err(MirrorError::Config("basedir_name must not be empty".into()));
        }
        if self.remote_root_id.trim().is_empty() {
            return Err(MirrorError::Config(
                "remote_root_id must not be empty".into(),
            ));
        }
        if self.workers.concurrency == 0 {
            return Err(MirrorError::Config(
                "workers.concurrency must be at least 1".into(),
            ));
        }
        if self.remote_retry.max_attempts == 0 {
            return Err(MirrorError::Config(
                "remote_retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// Task-level reschedule policy: `delay = min(base + step * retries, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskRetryPolicy {
    pub base_delay_ms: u64,
    pub step_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for TaskRetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            step_ms: 2_000,
            max_delay_ms: 128_000,
            max_retries: 10,
        }
    }
}

impl TaskRetryPolicy {
    /// Delay before the next attempt, given how many retries already happened
    pub fn delay_for(&self, retries: u32) -> Duration {
        let grown = self
            .base_delay_ms
            .saturating_add(self.step_ms.saturating_mul(u64::from(retries)));
        Duration::from_millis(grown.min(self.max_delay_ms))
    }

    pub fn is_exhausted(&self, retries: u32) -> bool {
        retries >= self.max_retries
    }
}

/// Transient remote failure policy, applied inside a single task attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Upper bound on listing pages followed for a single name lookup
    pub max_pages: u32,
}

impl Default for RemoteRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 16_000,
            max_pages: 1_000,
        }
    }
}

impl RemoteRetryPolicy {
    /// Exponential delay before attempt `attempt + 1` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.initial_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    /// Running tasks older than this are considered abandoned
    pub stale_after_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 500,
            stale_after_secs: 600,
        }
    }
}

/// Where local content lives
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    pub dmsf_dir: PathBuf,
    pub files_dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_delay_formula() {
        let policy = TaskRetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(500), Duration::from_secs(128));
        assert!(!policy.is_exhausted(9));
        assert!(policy.is_exhausted(10));
    }

    #[test]
    fn test_remote_delay_doubles_and_caps() {
        let policy = RemoteRetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(10), Duration::from_secs(16));
        assert_eq!(policy.delay_for(200), Duration::from_secs(16));
    }

    #[test]
    fn test_partial_toml() {
        let config: MirrorConfig = toml::from_str(
            r#"
            basedir_name = "Archive"

            [task_retry]
            max_retries = 3

            [content]
            dmsf_dir = "/srv/redmine/dmsf"
            "#,
        )
        .unwrap();
        assert_eq!(config.basedir_name, "Archive");
        assert_eq!(config.remote_root_id, "root");
        assert_eq!(config.task_retry.max_retries, 3);
        assert_eq!(config.task_retry.base_delay_ms, 2_000);
        assert_eq!(config.content.dmsf_dir, PathBuf::from("/srv/redmine/dmsf"));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = MirrorConfig::default();
        config.workers.concurrency = 0;
        assert!(matches!(config.validate(), Err(MirrorError::Config(_))));
    }
}

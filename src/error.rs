//! Error types for treemirror

use thiserror::Error;

use crate::types::EntityKind;

/// Result type alias for treemirror operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Main error type for treemirror
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{kind} {id} not found in source")]
    NotFound { kind: EntityKind, id: i64 },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Local content missing: {0}")]
    MissingContent(String),

    /// Transient remote failure (network, 5xx)
    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Rate limited: retry after {0} seconds")]
    RateLimited(u64),

    /// Permanent remote failure (4xx, malformed reply)
    #[error("Remote store rejected request: {0}")]
    RemoteRejected(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "drive")]
    Http(#[from] reqwest::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Check if error is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            MirrorError::Remote(_) | MirrorError::RateLimited(_) => true,
            #[cfg(feature = "drive")]
            MirrorError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            MirrorError::Database(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }

    /// Minimum wait hinted by the remote, if any
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            MirrorError::RateLimited(secs) => Some(*secs),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(MirrorError::Remote("reset by peer".into()).is_retryable());
        assert!(MirrorError::RateLimited(3).is_retryable());
        assert!(!MirrorError::RemoteRejected("404".into()).is_retryable());
        assert!(!MirrorError::MissingContent("/tmp/x".into()).is_retryable());
        assert!(!MirrorError::Conflict("rebind".into()).is_retryable());
    }

    #[test]
    fn test_retry_after_hint() {
        assert_eq!(MirrorError::RateLimited(7).retry_after_secs(), Some(7));
        assert_eq!(MirrorError::Remote("x".into()).retry_after_secs(), None);
    }
}

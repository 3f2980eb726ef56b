//! Setup shared by the binaries: common flags, config layering, logging

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::MirrorConfig;
use crate::context::MirrorContext;
use crate::error::{MirrorError, Result};
use crate::lock::SqliteTaskLock;
use crate::remote::RemoteStore;
use crate::source::{DiskContentLocator, SqliteSource};
use crate::storage::Storage;
use crate::types::StorageConfig;

/// Flags every binary accepts
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// TOML configuration file
    #[arg(long, env = "TREEMIRROR_CONFIG")]
    pub config: Option<String>,

    /// Mapping and task queue database
    #[arg(
        long,
        env = "TREEMIRROR_DB_PATH",
        default_value = "~/.local/share/treemirror/mirror.db"
    )]
    pub db_path: String,

    /// Redmine database (SQLite) read as the source tree
    #[arg(long, env = "TREEMIRROR_SOURCE_DB")]
    pub source_db: Option<String>,

    /// DMSF storage directory
    #[arg(long, env = "TREEMIRROR_DMSF_DIR")]
    pub dmsf_dir: Option<String>,

    /// Redmine attachment files directory
    #[arg(long, env = "TREEMIRROR_FILES_DIR")]
    pub files_dir: Option<String>,

    /// Remote id under which the basedir lives
    #[arg(long, env = "TREEMIRROR_REMOTE_ROOT")]
    pub remote_root: Option<String>,

    /// Drive bearer access token
    #[arg(long, env = "TREEMIRROR_DRIVE_TOKEN", hide_env_values = true)]
    pub drive_token: Option<String>,

    /// Drive API base URL
    #[arg(long, env = "TREEMIRROR_DRIVE_API_URL")]
    pub drive_api_url: Option<String>,

    /// Log as JSON lines
    #[arg(long, env = "TREEMIRROR_LOG_JSON")]
    pub log_json: bool,
}

fn expand(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}

impl CommonArgs {
    /// File configuration (or defaults) with flag overrides applied
    pub fn load_config(&self) -> Result<MirrorConfig> {
        let mut config = match &self.config {
            Some(path) => MirrorConfig::from_toml_file(expand(path))?,
            None => MirrorConfig::default(),
        };
        if let Some(dir) = &self.dmsf_dir {
            config.content.dmsf_dir = PathBuf::from(expand(dir));
        }
        if let Some(dir) = &self.files_dir {
            config.content.files_dir = PathBuf::from(expand(dir));
        }
        if let Some(root) = &self.remote_root {
            config.remote_root_id = root.clone();
        }
        config.validate()?;
        Ok(config)
    }

    /// Mapping/queue storage only; enough for status and queue commands
    pub fn open_storage(&self) -> Result<Storage> {
        Storage::open(StorageConfig::new(expand(&self.db_path)))
    }

    /// Full engine context backed by the Redmine database and Drive
    pub fn build_context(&self) -> Result<MirrorContext> {
        let config = self.load_config()?;
        let storage = self.open_storage()?;
        let source_db = self
            .source_db
            .as_deref()
            .ok_or_else(|| MirrorError::Config("--source-db is required".into()))?;
        let source = SqliteSource::open(expand(source_db))?;
        let content = DiskContentLocator::from_config(&config.content);
        let remote = self.remote()?;
        let locks = SqliteTaskLock::new(storage.clone());
        tracing::info!(
            db_path = %storage.db_path(),
            source_db,
            remote_root = %config.remote_root_id,
            "Context ready"
        );
        Ok(MirrorContext::new(
            config,
            storage,
            Arc::new(source),
            Arc::new(content),
            remote,
            Arc::new(locks),
        ))
    }

    #[cfg(feature = "drive")]
    fn remote(&self) -> Result<Arc<dyn RemoteStore>> {
        use crate::remote::{DriveConfig, DriveRemote};

        let token = self
            .drive_token
            .clone()
            .ok_or_else(|| MirrorError::Config("--drive-token is required".into()))?;
        let mut drive = DriveConfig::new(token);
        if let Some(url) = &self.drive_api_url {
            drive.api_url = url.trim_end_matches('/').to_string();
        }
        Ok(Arc::new(DriveRemote::new(drive)?))
    }

    #[cfg(not(feature = "drive"))]
    fn remote(&self) -> Result<Arc<dyn RemoteStore>> {
        Err(MirrorError::Config(
            "built without the `drive` feature; no remote store available".into(),
        ))
    }
}

/// Install the global subscriber: `RUST_LOG` filter, stderr, optional JSON
pub fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_ansi(false),
            )
            .init();
    }
}

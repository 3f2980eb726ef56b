//! Treemirror - idempotent tree mirroring
//!
//! Replicates a Redmine/DMSF project tree (projects, folders, files with
//! ordered revisions, documents with attachments) into a hierarchical
//! remote object store, keeping a durable source id to remote id mapping.
//! Two modes share the same primitives: a task queue driven incremental
//! mode for many concurrent workers, and a one-shot batch tree walk.

pub mod app;
pub mod batch;
pub mod config;
pub mod context;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod remote;
pub mod source;
pub mod storage;
pub mod tasks;
pub mod types;
pub mod uploader;

pub use batch::{BatchReport, BatchWalker};
pub use config::MirrorConfig;
pub use context::MirrorContext;
pub use error::{MirrorError, Result};
pub use gateway::{GatewayOutcome, RemoteGateway};
pub use storage::Storage;
pub use tasks::{Task, TaskQueue, WorkerPool};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

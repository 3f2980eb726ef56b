//! Core types for treemirror

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source id of the singleton basedir entity
pub const BASEDIR_SOURCE_ID: i64 = 0;

/// Mime type used for remote folders
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Kind of mirrored entity; one mapping key space per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Basedir,
    Project,
    ProjectDocs,
    ProjectDmsf,
    DmsfFolder,
    DmsfFileRevision,
    Document,
    DocumentAttachment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Basedir,
        EntityKind::Project,
        EntityKind::ProjectDocs,
        EntityKind::ProjectDmsf,
        EntityKind::DmsfFolder,
        EntityKind::DmsfFileRevision,
        EntityKind::Document,
        EntityKind::DocumentAttachment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Basedir => "basedir",
            EntityKind::Project => "project",
            EntityKind::ProjectDocs => "project_docs",
            EntityKind::ProjectDmsf => "project_dmsf",
            EntityKind::DmsfFolder => "dmsf_folder",
            EntityKind::DmsfFileRevision => "dmsf_file_revision",
            EntityKind::Document => "document",
            EntityKind::DocumentAttachment => "document_attachment",
        }
    }

    /// Whether the remote object for this kind is a folder
    pub fn is_container(&self) -> bool {
        !matches!(
            self,
            EntityKind::DmsfFileRevision | EntityKind::DocumentAttachment
        )
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        EntityKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown entity kind: {}", s))
    }
}

/// Identity of a mirrored entity: `(kind, source_id)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub source_id: i64,
}

impl EntityKey {
    pub fn new(kind: EntityKind, source_id: i64) -> Self {
        Self { kind, source_id }
    }

    pub fn basedir() -> Self {
        Self::new(EntityKind::Basedir, BASEDIR_SOURCE_ID)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.source_id)
    }
}

/// One row of the mapping store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub kind: EntityKind,
    pub source_id: i64,
    /// Write-once; `None` while the entity is only claimed
    pub remote_id: Option<String>,
    pub last_update: DateTime<Utc>,
}

impl MappingEntry {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.kind, self.source_id)
    }

    pub fn is_bound(&self) -> bool {
        self.remote_id.is_some()
    }
}

// =============================================================================
// Source entities (read-only inputs)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub identifier: String,
    pub description: Option<String>,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmsfFolder {
    pub id: i64,
    pub project_id: i64,
    pub parent_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmsfFile {
    pub id: i64,
    pub project_id: i64,
    /// `None` places the file at the project's DMSF root
    pub folder_id: Option<i64>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmsfRevision {
    pub id: i64,
    pub file_id: i64,
    pub project_id: i64,
    pub folder_id: Option<i64>,
    pub name: String,
    pub disk_filename: String,
    pub mime_type: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub comment: Option<String>,
    pub major_version: i32,
    pub minor_version: i32,
    pub updated_at: Option<DateTime<Utc>>,
}

impl DmsfRevision {
    /// Ordering key within a file
    pub fn version_key(&self) -> (i32, i32) {
        (self.major_version, self.minor_version)
    }

    /// Numeric version pushed to the remote store
    pub fn numeric_version(&self) -> i64 {
        i64::from(self.major_version) * 10_000 + i64::from(self.minor_version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub document_id: i64,
    pub filename: String,
    pub disk_filename: String,
    pub disk_directory: Option<String>,
    pub content_type: Option<String>,
    pub description: Option<String>,
    pub created_on: Option<DateTime<Utc>>,
}

/// Resolved local content of a revision or attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalContent {
    pub path: PathBuf,
    pub mime_type: String,
    pub size: u64,
}

/// Configuration for the mapping/queue database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database (`:memory:` for tests)
    pub db_path: String,
    /// How long a writer waits on another process holding the database
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout() -> u64 {
    30_000
}

impl StorageConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

/// Mapping store statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MappingStats {
    pub kind: String,
    pub bound: i64,
    pub unbound: i64,
}

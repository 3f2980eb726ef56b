//! Read-only access to the source tree
//!
//! The engine never writes through these traits. Revisions are returned
//! non-deleted and ordered by `(major_version, minor_version)`, except by
//! [`SourceCatalog::revision_history`].

mod content;
mod memory;
mod sqlite;

pub use content::{detect_mime, ContentLocator, DiskContentLocator, MemoryContentLocator};
pub use memory::MemorySource;
pub use sqlite::SqliteSource;

use crate::error::{MirrorError, Result};
use crate::types::{Attachment, DmsfFile, DmsfFolder, DmsfRevision, Document, EntityKind, Project};

/// Lookups by primary and foreign key over the source schema
pub trait SourceCatalog: Send + Sync {
    fn project(&self, id: i64) -> Result<Option<Project>>;
    fn projects(&self) -> Result<Vec<Project>>;

    fn folder(&self, id: i64) -> Result<Option<DmsfFolder>>;
    fn folders_in_project(&self, project_id: i64) -> Result<Vec<DmsfFolder>>;

    fn file(&self, id: i64) -> Result<Option<DmsfFile>>;
    fn files_in_project(&self, project_id: i64) -> Result<Vec<DmsfFile>>;

    fn revision(&self, id: i64) -> Result<Option<DmsfRevision>>;
    fn revisions_of_file(&self, file_id: i64) -> Result<Vec<DmsfRevision>>;
    /// Ids of every revision of a file in version order, deleted ones included
    fn revision_history(&self, file_id: i64) -> Result<Vec<i64>>;
    /// Every non-deleted revision
    fn revisions(&self) -> Result<Vec<DmsfRevision>>;

    fn document(&self, id: i64) -> Result<Option<Document>>;
    fn documents_in_project(&self, project_id: i64) -> Result<Vec<Document>>;

    fn attachment(&self, id: i64) -> Result<Option<Attachment>>;
    fn attachments_of_document(&self, document_id: i64) -> Result<Vec<Attachment>>;
    fn attachments(&self) -> Result<Vec<Attachment>>;
}

/// Turn a missing row into [`MirrorError::NotFound`]
pub fn require<T>(row: Option<T>, kind: EntityKind, id: i64) -> Result<T> {
    row.ok_or(MirrorError::NotFound { kind, id })
}

/// Sort revisions by their version key, ties by id
pub(crate) fn sort_revisions(revisions: &mut [DmsfRevision]) {
    revisions.sort_by_key(|r| (r.major_version, r.minor_version, r.id));
}

//! In-memory source tree

use std::collections::{BTreeMap, BTreeSet};

use super::{sort_revisions, SourceCatalog};
use crate::error::Result;
use crate::types::{Attachment, DmsfFile, DmsfFolder, DmsfRevision, Document, Project};

/// Source catalog held in memory, built with chained `with_*` calls
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    projects: BTreeMap<i64, Project>,
    folders: BTreeMap<i64, DmsfFolder>,
    files: BTreeMap<i64, DmsfFile>,
    revisions: BTreeMap<i64, DmsfRevision>,
    deleted_revisions: BTreeSet<i64>,
    documents: BTreeMap<i64, Document>,
    attachments: BTreeMap<i64, Attachment>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, id: i64, name: &str, parent_id: Option<i64>) -> Self {
        self.projects.insert(
            id,
            Project {
                id,
                name: name.to_string(),
                identifier: name.to_lowercase().replace(' ', "-"),
                description: None,
                parent_id,
            },
        );
        self
    }

    pub fn with_folder(mut self, id: i64, project_id: i64, parent_id: Option<i64>, title: &str) -> Self {
        self.folders.insert(
            id,
            DmsfFolder {
                id,
                project_id,
                parent_id,
                title: title.to_string(),
                description: None,
            },
        );
        self
    }

    pub fn with_file(mut self, id: i64, project_id: i64, folder_id: Option<i64>, name: &str) -> Self {
        self.files.insert(
            id,
            DmsfFile {
                id,
                project_id,
                folder_id,
                name: name.to_string(),
            },
        );
        self
    }

    /// Add a revision of an existing file; folder and project follow the file
    pub fn with_revision(mut self, id: i64, file_id: i64, major: i32, minor: i32) -> Self {
        let (project_id, folder_id, name) = self
            .files
            .get(&file_id)
            .map(|f| (f.project_id, f.folder_id, f.name.clone()))
            .unwrap_or((0, None, format!("file-{}", file_id)));
        self.revisions.insert(
            id,
            DmsfRevision {
                id,
                file_id,
                project_id,
                folder_id,
                name,
                disk_filename: format!("rev_{}", id),
                mime_type: Some("text/plain".to_string()),
                title: None,
                description: None,
                comment: None,
                major_version: major,
                minor_version: minor,
                updated_at: None,
            },
        );
        self
    }

    /// Record a revision under a folder other than its file's
    pub fn with_revision_folder(mut self, id: i64, folder_id: i64) -> Self {
        if let Some(revision) = self.revisions.get_mut(&id) {
            revision.folder_id = Some(folder_id);
        }
        self
    }

    /// Mark a revision deleted; it stays in the file's history only
    pub fn with_deleted_revision(mut self, id: i64) -> Self {
        self.deleted_revisions.insert(id);
        self
    }

    fn live_revisions(&self) -> impl Iterator<Item = &DmsfRevision> {
        self.revisions
            .values()
            .filter(|r| !self.deleted_revisions.contains(&r.id))
    }

    pub fn with_revision_row(mut self, revision: DmsfRevision) -> Self {
        self.revisions.insert(revision.id, revision);
        self
    }

    pub fn with_document(mut self, id: i64, project_id: i64, title: &str) -> Self {
        self.documents.insert(
            id,
            Document {
                id,
                project_id,
                title: title.to_string(),
                description: None,
            },
        );
        self
    }

    pub fn with_attachment(mut self, id: i64, document_id: i64, filename: &str) -> Self {
        self.attachments.insert(
            id,
            Attachment {
                id,
                document_id,
                filename: filename.to_string(),
                disk_filename: format!("att_{}", id),
                disk_directory: None,
                content_type: None,
                description: None,
                created_on: None,
            },
        );
        self
    }

    pub fn with_attachment_row(mut self, attachment: Attachment) -> Self {
        self.attachments.insert(attachment.id, attachment);
        self
    }
}

impl SourceCatalog for MemorySource {
    fn project(&self, id: i64) -> Result<Option<Project>> {
        Ok(self.projects.get(&id).cloned())
    }

    fn projects(&self) -> Result<Vec<Project>> {
        Ok(self.projects.values().cloned().collect())
    }

    fn folder(&self, id: i64) -> Result<Option<DmsfFolder>> {
        Ok(self.folders.get(&id).cloned())
    }

    fn folders_in_project(&self, project_id: i64) -> Result<Vec<DmsfFolder>> {
        Ok(self
            .folders
            .values()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect())
    }

    fn file(&self, id: i64) -> Result<Option<DmsfFile>> {
        Ok(self.files.get(&id).cloned())
    }

    fn files_in_project(&self, project_id: i64) -> Result<Vec<DmsfFile>> {
        Ok(self
            .files
            .values()
            .filter(|f| f.project_id == project_id)
            .cloned()
            .collect())
    }

    fn revision(&self, id: i64) -> Result<Option<DmsfRevision>> {
        Ok(self.live_revisions().find(|r| r.id == id).cloned())
    }

    fn revisions_of_file(&self, file_id: i64) -> Result<Vec<DmsfRevision>> {
        let mut revisions: Vec<DmsfRevision> = self
            .live_revisions()
            .filter(|r| r.file_id == file_id)
            .cloned()
            .collect();
        sort_revisions(&mut revisions);
        Ok(revisions)
    }

    fn revision_history(&self, file_id: i64) -> Result<Vec<i64>> {
        let mut revisions: Vec<DmsfRevision> = self
            .revisions
            .values()
            .filter(|r| r.file_id == file_id)
            .cloned()
            .collect();
        sort_revisions(&mut revisions);
        Ok(revisions.into_iter().map(|r| r.id).collect())
    }

    fn revisions(&self) -> Result<Vec<DmsfRevision>> {
        Ok(self.live_revisions().cloned().collect())
    }

    fn document(&self, id: i64) -> Result<Option<Document>> {
        Ok(self.documents.get(&id).cloned())
    }

    fn documents_in_project(&self, project_id: i64) -> Result<Vec<Document>> {
        Ok(self
            .documents
            .values()
            .filter(|d| d.project_id == project_id)
            .cloned()
            .collect())
    }

    fn attachment(&self, id: i64) -> Result<Option<Attachment>> {
        Ok(self.attachments.get(&id).cloned())
    }

    fn attachments_of_document(&self, document_id: i64) -> Result<Vec<Attachment>> {
        Ok(self
            .attachments
            .values()
            .filter(|a| a.document_id == document_id)
            .cloned()
            .collect())
    }

    fn attachments(&self) -> Result<Vec<Attachment>> {
        Ok(self.attachments.values().cloned().collect())
    }
}

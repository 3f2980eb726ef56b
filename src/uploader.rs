//! Revision and attachment uploads
//!
//! A DMSF file maps to one remote object. The earliest bound row in the
//! file's revision history holds the object id, even once that revision is
//! deleted in the source. Every later revision is pushed onto that object
//! as a new version, strictly in `(major, minor)` order, and bound on its
//! own so an interrupted sequence resumes where it stopped.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MirrorError, Result};
use crate::gateway::{GatewayOutcome, ObjectSpec, RemoteGateway};
use crate::remote::retry::with_retry;
use crate::remote::{Upload, VersionMetadata};
use crate::source::{require, ContentLocator, SourceCatalog};
use crate::storage::{mapping, Storage};
use crate::types::{Attachment, DmsfRevision, EntityKey, EntityKind, LocalContent};

/// Result of syncing one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileUploadReport {
    pub object_id: Option<String>,
    /// The remote object was created by this call
    pub created: bool,
    /// The remote object already existed by name and was bound
    pub reconciled: bool,
    pub versions_pushed: usize,
    /// Unbound revisions older than the newest bound one
    pub skipped_revisions: Vec<i64>,
    /// Another worker claimed the initial revision row concurrently
    pub contended: bool,
    /// No revision of the file has local content
    pub no_content: bool,
}

impl FileUploadReport {
    pub fn mutations(&self) -> usize {
        usize::from(self.created) + self.versions_pushed
    }
}

/// Description pushed with a revision
pub fn revision_description(revision: &DmsfRevision) -> String {
    format!(
        "{}\nCreated from revision {}.{} from DMSF id {}",
        revision.description.as_deref().unwrap_or_default(),
        revision.major_version,
        revision.minor_version,
        revision.file_id
    )
}

/// Description pushed with a document attachment
pub fn attachment_description(attachment: &Attachment) -> String {
    format!(
        "{}\nCreated from {} id {}",
        attachment.description.as_deref().unwrap_or_default(),
        EntityKind::DocumentAttachment,
        attachment.id
    )
}

/// Uploads revisions and attachments through the gateway
#[derive(Clone)]
pub struct RevisionUploader {
    gateway: RemoteGateway,
    storage: Storage,
    source: Arc<dyn SourceCatalog>,
    content: Arc<dyn ContentLocator>,
}

impl RevisionUploader {
    pub fn new(
        gateway: RemoteGateway,
        storage: Storage,
        source: Arc<dyn SourceCatalog>,
        content: Arc<dyn ContentLocator>,
    ) -> Self {
        Self {
            gateway,
            storage,
            source,
            content,
        }
    }

    fn project_identifier(&self, project_id: i64) -> Result<String> {
        let project = require(self.source.project(project_id)?, EntityKind::Project, project_id)?;
        Ok(project.identifier)
    }

    /// Revisions of a file that have local content, in version order
    pub fn uploadable_revisions(&self, file_id: i64) -> Result<Vec<(DmsfRevision, LocalContent)>> {
        let revisions = self.source.revisions_of_file(file_id)?;
        let Some(first) = revisions.first() else {
            return Ok(Vec::new());
        };
        let identifier = self.project_identifier(first.project_id)?;
        let mut uploadable = Vec::with_capacity(revisions.len());
        for revision in revisions {
            if let Some(content) = self.content.locate_revision(&revision, &identifier)? {
                uploadable.push((revision, content));
            }
        }
        Ok(uploadable)
    }

    /// Revision whose object placement decides where the file lives
    pub fn lead_revision(&self, file_id: i64) -> Result<Option<DmsfRevision>> {
        Ok(self
            .uploadable_revisions(file_id)?
            .into_iter()
            .next()
            .map(|(revision, _)| revision))
    }

    /// Read local bytes off the async runtime
    async fn read_content(&self, content: &LocalContent) -> Result<Vec<u8>> {
        let locator = Arc::clone(&self.content);
        let content = content.clone();
        tokio::task::spawn_blocking(move || locator.read(&content))
            .await
            .map_err(|e| MirrorError::Internal(e.to_string()))?
    }

    async fn revision_upload(&self, revision: &DmsfRevision, content: &LocalContent) -> Result<Upload> {
        Ok(Upload {
            mime_type: content.mime_type.clone(),
            bytes: self.read_content(content).await?,
            metadata: VersionMetadata {
                modified: revision.updated_at,
                description: Some(revision_description(revision)),
                version: revision.numeric_version(),
            },
        })
    }

    /// Bring the remote object of `file_id` up to `target` (or its newest
    /// revision), creating it under `parent_remote_id` if needed.
    pub async fn sync_file(
        &self,
        file_id: i64,
        target: Option<i64>,
        parent_remote_id: &str,
    ) -> Result<FileUploadReport> {
        let revisions = self.source.revisions_of_file(file_id)?;
        if let Some(target_id) = target {
            let revision = revisions
                .iter()
                .find(|r| r.id == target_id)
                .ok_or(MirrorError::NotFound {
                    kind: EntityKind::DmsfFileRevision,
                    id: target_id,
                })?;
            let identifier = self.project_identifier(revision.project_id)?;
            if self.content.locate_revision(revision, &identifier)?.is_none() {
                return Err(MirrorError::MissingContent(format!(
                    "revision {} ({}) of file {}",
                    revision.id, revision.disk_filename, file_id
                )));
            }
        }

        let uploadable = self.uploadable_revisions(file_id)?;
        let mut report = FileUploadReport::default();
        if uploadable.is_empty() {
            tracing::info!(file_id, "No revision with local content, skipping file");
            report.no_content = true;
            return Ok(report);
        }

        let history = self.source.revision_history(file_id)?;
        let bound: HashMap<i64, String> = self.storage.with_connection(|conn| {
            let mut bound = HashMap::new();
            for &id in &history {
                let key = EntityKey::new(EntityKind::DmsfFileRevision, id);
                if let Some(remote_id) = mapping::lookup(conn, key)? {
                    bound.insert(id, remote_id);
                }
            }
            Ok(bound)
        })?;
        report.object_id = history.iter().find_map(|id| bound.get(id)).cloned();
        let newest_bound = history.iter().rposition(|id| bound.contains_key(id));

        for (revision, content) in &uploadable {
            let key = EntityKey::new(EntityKind::DmsfFileRevision, revision.id);
            let position = history.iter().position(|&id| id == revision.id);

            if !bound.contains_key(&revision.id) {
                let stale = match (position, newest_bound) {
                    (Some(position), Some(newest)) => position < newest,
                    _ => false,
                };
                if stale {
                    tracing::warn!(
                        file_id,
                        revision_id = revision.id,
                        version = %format!("{}.{}", revision.major_version, revision.minor_version),
                        "Revision is older than the newest pushed version, not pushing"
                    );
                    report.skipped_revisions.push(revision.id);
                } else {
                    match report.object_id.clone() {
                        None => {
                            let upload = self.revision_upload(revision, content).await?;
                            let outcome = self
                                .gateway
                                .create_or_find(key, parent_remote_id, &revision.name, ObjectSpec::File(upload))
                                .await?;
                            match outcome {
                                GatewayOutcome::Contended => {
                                    report.contended = true;
                                    return Ok(report);
                                }
                                GatewayOutcome::Created(id) => {
                                    report.created = true;
                                    report.object_id = Some(id);
                                }
                                GatewayOutcome::Reconciled(id) => {
                                    report.reconciled = true;
                                    report.object_id = Some(id);
                                }
                                GatewayOutcome::Existing(id) => report.object_id = Some(id),
                            }
                        }
                        Some(object_id) => {
                            self.push_version(key, &object_id, revision, content).await?;
                            report.versions_pushed += 1;
                        }
                    }
                }
            }

            if target == Some(revision.id) {
                break;
            }
        }
        Ok(report)
    }

    async fn push_version(
        &self,
        key: EntityKey,
        object_id: &str,
        revision: &DmsfRevision,
        content: &LocalContent,
    ) -> Result<String> {
        self.storage
            .with_connection(|conn| mapping::create_placeholder(conn, key))?;
        let upload = self.revision_upload(revision, content).await?;
        let policy = *self.gateway.policy();
        let remote = self.gateway.remote();
        let upload = &upload;
        let revision_id = with_retry(&policy, "update_object_content", move || {
            remote.update_object_content(object_id, upload.clone())
        })
        .await?;
        tracing::info!(
            entity = %key,
            object_id,
            remote_revision = %revision_id,
            version = revision.numeric_version(),
            "Pushed new version"
        );
        self.gateway.bind(key, &revision_id)?;
        Ok(revision_id)
    }

    /// Upload a document attachment as a single-version file
    pub async fn upload_attachment(
        &self,
        attachment: &Attachment,
        parent_remote_id: &str,
    ) -> Result<GatewayOutcome> {
        let key = EntityKey::new(EntityKind::DocumentAttachment, attachment.id);
        if let Some(id) = self.gateway.lookup(key)? {
            return Ok(GatewayOutcome::Existing(id));
        }
        let content = self.content.locate_attachment(attachment)?.ok_or_else(|| {
            MirrorError::MissingContent(format!(
                "attachment {} ({})",
                attachment.id, attachment.disk_filename
            ))
        })?;
        let upload = Upload {
            mime_type: content.mime_type.clone(),
            bytes: self.read_content(&content).await?,
            metadata: VersionMetadata {
                modified: attachment.created_on,
                description: Some(attachment_description(attachment)),
                version: 1,
            },
        };
        self.gateway
            .create_or_find(key, parent_remote_id, &attachment.filename, ObjectSpec::File(upload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RemoteRetryPolicy;
    use crate::remote::{MemoryRemote, RemoteCall, MEMORY_ROOT_ID};
    use crate::source::{DiskContentLocator, MemoryContentLocator, MemorySource};

    struct Fixture {
        uploader: RevisionUploader,
        remote: Arc<MemoryRemote>,
        storage: Storage,
    }

    fn fixture(source: MemorySource, content: MemoryContentLocator) -> Fixture {
        let storage = Storage::open_in_memory().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let policy = RemoteRetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            max_pages: 10,
        };
        let gateway = RemoteGateway::new(storage.clone(), remote.clone(), policy);
        let uploader = RevisionUploader::new(
            gateway,
            storage.clone(),
            Arc::new(source),
            Arc::new(content),
        );
        Fixture {
            uploader,
            remote,
            storage,
        }
    }

    fn three_revisions() -> MemorySource {
        MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_file(10, 1, None, "a.txt")
            .with_revision(100, 10, 1, 0)
            .with_revision(101, 10, 1, 1)
            .with_revision(102, 10, 2, 0)
    }

    fn pushed_versions(remote: &MemoryRemote) -> Vec<i64> {
        remote
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                RemoteCall::Update { version, .. } => Some(version),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_full_sequence_creates_then_pushes() {
        let f = fixture(three_revisions(), MemoryContentLocator::new());
        let report = f.uploader.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();
        assert!(report.created);
        assert_eq!(report.versions_pushed, 2);

        let object_id = report.object_id.unwrap();
        let object = f.remote.object(&object_id).unwrap();
        assert_eq!(object.versions, vec![10000, 10001, 20000]);
        assert_eq!(
            object.descriptions[1].as_deref(),
            Some("\nCreated from revision 1.1 from DMSF id 10")
        );

        let bound = f
            .storage
            .with_connection(|conn| mapping::load_bound(conn, EntityKind::DmsfFileRevision))
            .unwrap();
        assert_eq!(bound.len(), 3);
        assert_eq!(bound[&100], object_id);
    }

    #[tokio::test]
    async fn test_target_stops_the_sequence() {
        let f = fixture(three_revisions(), MemoryContentLocator::new());
        let report = f.uploader.sync_file(10, Some(101), MEMORY_ROOT_ID).await.unwrap();
        assert_eq!(report.mutations(), 2);

        // Resuming only pushes what is missing
        f.remote.clear_calls();
        let report = f.uploader.sync_file(10, Some(102), MEMORY_ROOT_ID).await.unwrap();
        assert_eq!(report.mutations(), 1);
        assert_eq!(pushed_versions(&f.remote), vec![20000]);

        f.remote.clear_calls();
        let report = f.uploader.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();
        assert_eq!(report.mutations(), 0);
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_target_content_fails() {
        let f = fixture(three_revisions(), MemoryContentLocator::new().without("rev_101"));
        let err = f.uploader.sync_file(10, Some(101), MEMORY_ROOT_ID).await.unwrap_err();
        assert!(matches!(err, MirrorError::MissingContent(_)));

        // Without a target the gap is skipped
        let report = f.uploader.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();
        assert_eq!(report.mutations(), 2);
        assert_eq!(pushed_versions(&f.remote), vec![20000]);
    }

    #[tokio::test]
    async fn test_file_without_content_is_skipped() {
        let content = MemoryContentLocator::new()
            .without("rev_100")
            .without("rev_101")
            .without("rev_102");
        let f = fixture(three_revisions(), content);
        let report = f.uploader.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();
        assert!(report.no_content);
        assert_eq!(f.remote.object_count(), 0);
    }

    #[tokio::test]
    async fn test_late_revision_is_not_pushed_out_of_order() {
        let content = MemoryContentLocator::new().without("rev_101");
        let f = fixture(three_revisions(), content);
        f.uploader.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();

        // 1.1 shows up after 2.0 was pushed
        let f2 = RevisionUploader::new(
            f.uploader.gateway.clone(),
            f.storage.clone(),
            Arc::new(three_revisions()),
            Arc::new(MemoryContentLocator::new()),
        );
        f.remote.clear_calls();
        let report = f2.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();
        assert_eq!(report.skipped_revisions, vec![101]);
        assert_eq!(report.mutations(), 0);
    }

    #[tokio::test]
    async fn test_deleted_initial_revision_keeps_object() {
        let source = MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_file(10, 1, None, "a.txt")
            .with_revision(100, 10, 1, 0)
            .with_revision(101, 10, 1, 1);
        let f = fixture(source, MemoryContentLocator::new());
        let first = f.uploader.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();
        let object_id = first.object_id.unwrap();

        // 1.0 is deleted in the source and 2.0 appears
        let later = MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_file(10, 1, None, "a.txt")
            .with_revision(100, 10, 1, 0)
            .with_revision(101, 10, 1, 1)
            .with_revision(102, 10, 2, 0)
            .with_deleted_revision(100);
        let f2 = RevisionUploader::new(
            f.uploader.gateway.clone(),
            f.storage.clone(),
            Arc::new(later),
            Arc::new(MemoryContentLocator::new()),
        );
        f.remote.clear_calls();
        let report = f2.sync_file(10, Some(102), MEMORY_ROOT_ID).await.unwrap();
        assert_eq!(report.object_id.as_deref(), Some(object_id.as_str()));
        assert_eq!(report.versions_pushed, 1);
        assert_eq!(
            f.remote.object(&object_id).unwrap().versions,
            vec![10000, 10001, 20000]
        );
    }

    #[tokio::test]
    async fn test_disk_content_read_off_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("p_alpha");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("rev_100"), b"hello disk").unwrap();

        let source = MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_file(10, 1, None, "a.txt")
            .with_revision(100, 10, 1, 0);
        let storage = Storage::open_in_memory().unwrap();
        let remote = Arc::new(MemoryRemote::new());
        let gateway = RemoteGateway::new(storage.clone(), remote.clone(), RemoteRetryPolicy::default());
        let uploader = RevisionUploader::new(
            gateway,
            storage,
            Arc::new(source),
            Arc::new(DiskContentLocator::new(dir.path(), dir.path())),
        );

        let report = uploader.sync_file(10, None, MEMORY_ROOT_ID).await.unwrap();
        let object = remote.object(&report.object_id.unwrap()).unwrap();
        assert_eq!(object.size, 10);
    }

    #[tokio::test]
    async fn test_attachment_upload() {
        let source = MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_document(7, 1, "Minutes")
            .with_attachment(70, 7, "notes.txt");
        let f = fixture(source.clone(), MemoryContentLocator::new());
        let attachment = source.attachment(70).unwrap().unwrap();

        let outcome = f
            .uploader
            .upload_attachment(&attachment, MEMORY_ROOT_ID)
            .await
            .unwrap();
        let id = outcome.remote_id().unwrap().to_string();
        let object = f.remote.object(&id).unwrap();
        assert_eq!(object.mime_type, "text/plain");
        assert_eq!(object.versions, vec![1]);

        let again = f
            .uploader
            .upload_attachment(&attachment, MEMORY_ROOT_ID)
            .await
            .unwrap();
        assert_eq!(again, GatewayOutcome::Existing(id));
    }
}

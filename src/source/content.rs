//! Local content lookup for revisions and attachments

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::config::ContentConfig;
use crate::error::{MirrorError, Result};
use crate::types::{Attachment, DmsfRevision, LocalContent};

const FALLBACK_MIME_TYPE: &str = "application/octet-stream";

/// Resolves where the bytes of a leaf entity live
pub trait ContentLocator: Send + Sync {
    /// `None` when no content exists for the revision
    fn locate_revision(
        &self,
        revision: &DmsfRevision,
        project_identifier: &str,
    ) -> Result<Option<LocalContent>>;

    fn locate_attachment(&self, attachment: &Attachment) -> Result<Option<LocalContent>>;

    fn read(&self, content: &LocalContent) -> Result<Vec<u8>> {
        std::fs::read(&content.path).map_err(|e| {
            MirrorError::MissingContent(format!("{}: {}", content.path.display(), e))
        })
    }
}

/// Mime type from the stored value, else guessed from the display name
pub fn detect_mime(declared: Option<&str>, name: &str) -> String {
    match declared.map(str::trim).filter(|mime| !mime.is_empty()) {
        Some(mime) => mime.to_string(),
        None => mime_guess::from_path(name)
            .first_raw()
            .unwrap_or(FALLBACK_MIME_TYPE)
            .to_string(),
    }
}

/// Filesystem layout of a Redmine installation
#[derive(Debug, Clone)]
pub struct DiskContentLocator {
    dmsf_dir: PathBuf,
    files_dir: PathBuf,
}

impl DiskContentLocator {
    pub fn new(dmsf_dir: impl Into<PathBuf>, files_dir: impl Into<PathBuf>) -> Self {
        Self {
            dmsf_dir: dmsf_dir.into(),
            files_dir: files_dir.into(),
        }
    }

    pub fn from_config(config: &ContentConfig) -> Self {
        Self::new(&config.dmsf_dir, &config.files_dir)
    }

    fn stat(path: &Path, mime_type: String) -> Result<Option<LocalContent>> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(LocalContent {
                path: path.to_path_buf(),
                mime_type,
                size: meta.len(),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl ContentLocator for DiskContentLocator {
    fn locate_revision(
        &self,
        revision: &DmsfRevision,
        project_identifier: &str,
    ) -> Result<Option<LocalContent>> {
        let mime = detect_mime(revision.mime_type.as_deref(), &revision.name);
        let candidates = [
            self.dmsf_dir
                .join(format!("p_{}", project_identifier))
                .join(&revision.disk_filename),
            self.dmsf_dir.join(&revision.disk_filename),
        ];
        for path in &candidates {
            if let Some(found) = Self::stat(path, mime.clone())? {
                return Ok(Some(found));
            }
        }
        tracing::debug!(
            revision_id = revision.id,
            disk_filename = %revision.disk_filename,
            "No local content for revision"
        );
        Ok(None)
    }

    fn locate_attachment(&self, attachment: &Attachment) -> Result<Option<LocalContent>> {
        let mime = detect_mime(attachment.content_type.as_deref(), &attachment.filename);
        let path = match &attachment.disk_directory {
            Some(dir) => self.files_dir.join(dir).join(&attachment.disk_filename),
            None => self.files_dir.join(&attachment.disk_filename),
        };
        Self::stat(&path, mime)
    }
}

/// Content held in memory; every disk filename is present unless removed
#[derive(Debug, Default)]
pub struct MemoryContentLocator {
    missing: RwLock<HashSet<String>>,
}

impl MemoryContentLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a disk filename as absent
    pub fn without(self, disk_filename: &str) -> Self {
        self.missing.write().insert(disk_filename.to_string());
        self
    }

    pub fn remove(&self, disk_filename: &str) {
        self.missing.write().insert(disk_filename.to_string());
    }

    pub fn restore(&self, disk_filename: &str) {
        self.missing.write().remove(disk_filename);
    }

    fn lookup(&self, disk_filename: &str, mime_type: String) -> Option<LocalContent> {
        if self.missing.read().contains(disk_filename) {
            return None;
        }
        Some(LocalContent {
            path: PathBuf::from(disk_filename),
            mime_type,
            size: Self::bytes_for(disk_filename).len() as u64,
        })
    }

    fn bytes_for(disk_filename: &str) -> Vec<u8> {
        format!("content of {}", disk_filename).into_bytes()
    }
}

impl ContentLocator for MemoryContentLocator {
    fn locate_revision(
        &self,
        revision: &DmsfRevision,
        _project_identifier: &str,
    ) -> Result<Option<LocalContent>> {
        let mime = detect_mime(revision.mime_type.as_deref(), &revision.name);
        Ok(self.lookup(&revision.disk_filename, mime))
    }

    fn locate_attachment(&self, attachment: &Attachment) -> Result<Option<LocalContent>> {
        let mime = detect_mime(attachment.content_type.as_deref(), &attachment.filename);
        Ok(self.lookup(&attachment.disk_filename, mime))
    }

    fn read(&self, content: &LocalContent) -> Result<Vec<u8>> {
        let name = content.path.to_string_lossy();
        if self.missing.read().contains(name.as_ref()) {
            return Err(MirrorError::MissingContent(name.into_owned()));
        }
        Ok(Self::bytes_for(&name))
    }
}

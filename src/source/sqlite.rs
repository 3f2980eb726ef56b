//! Source catalog over a Redmine/DMSF database

use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use super::SourceCatalog;
use crate::error::Result;
use crate::types::{Attachment, DmsfFile, DmsfFolder, DmsfRevision, Document, Project};

/// Read-only view of the Redmine tables the mirror needs
pub struct SqliteSource {
    conn: Mutex<Connection>,
}

const PROJECT_COLUMNS: &str = "id, name, identifier, description, parent_id";
const FOLDER_COLUMNS: &str = "id, project_id, dmsf_folder_id, title, description";
const FILE_COLUMNS: &str = "id, project_id, dmsf_folder_id, name";
const REVISION_COLUMNS: &str = "r.id, r.dmsf_file_id, r.project_id,
    COALESCE(r.dmsf_folder_id, f.dmsf_folder_id) AS folder_id,
    r.name, r.disk_filename, r.mime_type, r.title, r.description, r.comment,
    r.major_version, r.minor_version, r.updated_at";
const DOCUMENT_COLUMNS: &str = "id, project_id, title, description";
const ATTACHMENT_COLUMNS: &str = "id, container_id, filename, disk_filename, disk_directory,
    content_type, description, created_on";

impl SqliteSource {
    /// Open an existing database; the file is never written
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already-open connection (tests build fixtures in memory)
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    fn query_one<T>(
        &self,
        sql: &str,
        id: i64,
        map: fn(&Row) -> rusqlite::Result<T>,
    ) -> Result<Option<T>> {
        let conn = self.conn.lock();
        Ok(conn.query_row(sql, params![id], map).optional()?)
    }

    fn query_many<T, P: rusqlite::Params>(
        &self,
        sql: &str,
        args: P,
        map: fn(&Row) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(args, map)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// Redmine stores `YYYY-MM-DD HH:MM:SS` in UTC; RFC 3339 is accepted too
fn parse_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn row_to_project(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        identifier: row
            .get::<_, Option<String>>("identifier")?
            .unwrap_or_default(),
        description: row.get("description")?,
        parent_id: row.get("parent_id")?,
    })
}

fn row_to_folder(row: &Row) -> rusqlite::Result<DmsfFolder> {
    Ok(DmsfFolder {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        parent_id: row.get("dmsf_folder_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
    })
}

fn row_to_file(row: &Row) -> rusqlite::Result<DmsfFile> {
    Ok(DmsfFile {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        folder_id: row.get("dmsf_folder_id")?,
        name: row.get("name")?,
    })
}

fn row_to_revision(row: &Row) -> rusqlite::Result<DmsfRevision> {
    Ok(DmsfRevision {
        id: row.get("id")?,
        file_id: row.get("dmsf_file_id")?,
        project_id: row.get("project_id")?,
        folder_id: row.get("folder_id")?,
        name: row.get("name")?,
        disk_filename: row.get("disk_filename")?,
        mime_type: row.get("mime_type")?,
        title: row.get("title")?,
        description: row.get("description")?,
        comment: row.get("comment")?,
        major_version: row.get("major_version")?,
        minor_version: row.get("minor_version")?,
        updated_at: parse_timestamp(row.get("updated_at")?),
    })
}

fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    Ok(Document {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
    })
}

fn row_to_attachment(row: &Row) -> rusqlite::Result<Attachment> {
    Ok(Attachment {
        id: row.get("id")?,
        document_id: row.get("container_id")?,
        filename: row.get("filename")?,
        disk_filename: row.get("disk_filename")?,
        disk_directory: row
            .get::<_, Option<String>>("disk_directory")?
            .filter(|dir| !dir.is_empty()),
        content_type: row
            .get::<_, Option<String>>("content_type")?
            .filter(|mime| !mime.is_empty()),
        description: row.get("description")?,
        created_on: parse_timestamp(row.get("created_on")?),
    })
}

impl SourceCatalog for SqliteSource {
    fn project(&self, id: i64) -> Result<Option<Project>> {
        self.query_one(
            &format!("SELECT {} FROM projects WHERE id = ?", PROJECT_COLUMNS),
            id,
            row_to_project,
        )
    }

    fn projects(&self) -> Result<Vec<Project>> {
        self.query_many(
            &format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS),
            [],
            row_to_project,
        )
    }

    fn folder(&self, id: i64) -> Result<Option<DmsfFolder>> {
        self.query_one(
            &format!("SELECT {} FROM dmsf_folders WHERE id = ?", FOLDER_COLUMNS),
            id,
            row_to_folder,
        )
    }

    fn folders_in_project(&self, project_id: i64) -> Result<Vec<DmsfFolder>> {
        self.query_many(
            &format!(
                "SELECT {} FROM dmsf_folders WHERE project_id = ? ORDER BY id",
                FOLDER_COLUMNS
            ),
            params![project_id],
            row_to_folder,
        )
    }

    fn file(&self, id: i64) -> Result<Option<DmsfFile>> {
        self.query_one(
            &format!(
                "SELECT {} FROM dmsf_files WHERE id = ? AND deleted = 0",
                FILE_COLUMNS
            ),
            id,
            row_to_file,
        )
    }

    fn files_in_project(&self, project_id: i64) -> Result<Vec<DmsfFile>> {
        self.query_many(
            &format!(
                "SELECT {} FROM dmsf_files WHERE project_id = ? AND deleted = 0 ORDER BY id",
                FILE_COLUMNS
            ),
            params![project_id],
            row_to_file,
        )
    }

    fn revision(&self, id: i64) -> Result<Option<DmsfRevision>> {
        self.query_one(
            &format!(
                "SELECT {} FROM dmsf_file_revisions r
                 JOIN dmsf_files f ON f.id = r.dmsf_file_id
                 WHERE r.id = ? AND r.deleted = 0",
                REVISION_COLUMNS
            ),
            id,
            row_to_revision,
        )
    }

    fn revisions_of_file(&self, file_id: i64) -> Result<Vec<DmsfRevision>> {
        self.query_many(
            &format!(
                "SELECT {} FROM dmsf_file_revisions r
                 JOIN dmsf_files f ON f.id = r.dmsf_file_id
                 WHERE r.dmsf_file_id = ? AND r.deleted = 0
                 ORDER BY r.major_version, r.minor_version, r.id",
                REVISION_COLUMNS
            ),
            params![file_id],
            row_to_revision,
        )
    }

    fn revision_history(&self, file_id: i64) -> Result<Vec<i64>> {
        self.query_many(
            "SELECT id FROM dmsf_file_revisions WHERE dmsf_file_id = ?
             ORDER BY major_version, minor_version, id",
            params![file_id],
            |row| row.get(0),
        )
    }

    fn revisions(&self) -> Result<Vec<DmsfRevision>> {
        self.query_many(
            &format!(
                "SELECT {} FROM dmsf_file_revisions r
                 JOIN dmsf_files f ON f.id = r.dmsf_file_id
                 WHERE r.deleted = 0
                 ORDER BY r.dmsf_file_id, r.major_version, r.minor_version, r.id",
                REVISION_COLUMNS
            ),
            [],
            row_to_revision,
        )
    }

    fn document(&self, id: i64) -> Result<Option<Document>> {
        self.query_one(
            &format!("SELECT {} FROM documents WHERE id = ?", DOCUMENT_COLUMNS),
            id,
            row_to_document,
        )
    }

    fn documents_in_project(&self, project_id: i64) -> Result<Vec<Document>> {
        self.query_many(
            &format!(
                "SELECT {} FROM documents WHERE project_id = ? ORDER BY id",
                DOCUMENT_COLUMNS
            ),
            params![project_id],
            row_to_document,
        )
    }

    fn attachment(&self, id: i64) -> Result<Option<Attachment>> {
        self.query_one(
            &format!(
                "SELECT {} FROM attachments WHERE id = ? AND container_type = 'Document'",
                ATTACHMENT_COLUMNS
            ),
            id,
            row_to_attachment,
        )
    }

    fn attachments_of_document(&self, document_id: i64) -> Result<Vec<Attachment>> {
        self.query_many(
            &format!(
                "SELECT {} FROM attachments
                 WHERE container_id = ? AND container_type = 'Document' ORDER BY id",
                ATTACHMENT_COLUMNS
            ),
            params![document_id],
            row_to_attachment,
        )
    }

    fn attachments(&self) -> Result<Vec<Attachment>> {
        self.query_many(
            &format!(
                "SELECT {} FROM attachments WHERE container_type = 'Document' ORDER BY id",
                ATTACHMENT_COLUMNS
            ),
            [],
            row_to_attachment,
        )
    }
}

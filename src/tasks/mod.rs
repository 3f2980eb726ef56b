//! Incremental mode: durable tasks, dependency resolution and workers
//!
//! Each task materializes one entity. A task whose remote parent is not
//! bound yet enqueues the parent's task and reschedules itself; nothing
//! ever blocks waiting on another entity.

mod queue;
mod resolver;
mod worker;

pub use queue::{ClaimedTask, TaskQueue};
pub use resolver::{ParentLink, Resolver};
pub use worker::{PoolReport, WorkerPool};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MirrorError, Result};
use crate::lock::task_lock_key;
use crate::types::{EntityKey, EntityKind};

/// Lock name shared by all revision uploads of one file
pub const FILE_LOCK_TASK_NAME: &str = "upload_dmsf_file";

/// A unit of queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    /// Enqueue an upload for every revision and attachment not yet mapped
    SeedTree,
    CreateBasedir,
    CreateProjectFolder { project_id: i64 },
    CreateProjectDocumentsFolder { project_id: i64 },
    CreateProjectDmsfFolder { project_id: i64 },
    CreateDmsfFolder { folder_id: i64 },
    CreateDocumentFolder { document_id: i64 },
    UploadDmsfRevision { revision_id: i64 },
    UploadDocumentAttachment { attachment_id: i64 },
}

impl Task {
    pub const NAMES: [&'static str; 9] = [
        "seed_tree",
        "create_basedir",
        "create_project_folder",
        "create_project_documents_folder",
        "create_project_dmsf_folder",
        "create_dmsf_folder",
        "create_document_folder",
        "upload_dmsf_revision",
        "upload_document_attachment",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Task::SeedTree => "seed_tree",
            Task::CreateBasedir => "create_basedir",
            Task::CreateProjectFolder { .. } => "create_project_folder",
            Task::CreateProjectDocumentsFolder { .. } => "create_project_documents_folder",
            Task::CreateProjectDmsfFolder { .. } => "create_project_dmsf_folder",
            Task::CreateDmsfFolder { .. } => "create_dmsf_folder",
            Task::CreateDocumentFolder { .. } => "create_document_folder",
            Task::UploadDmsfRevision { .. } => "upload_dmsf_revision",
            Task::UploadDocumentAttachment { .. } => "upload_document_attachment",
        }
    }

    /// The entity this task materializes
    pub fn entity(&self) -> Option<EntityKey> {
        let (kind, id) = match *self {
            Task::SeedTree => return None,
            Task::CreateBasedir => return Some(EntityKey::basedir()),
            Task::CreateProjectFolder { project_id } => (EntityKind::Project, project_id),
            Task::CreateProjectDocumentsFolder { project_id } => (EntityKind::ProjectDocs, project_id),
            Task::CreateProjectDmsfFolder { project_id } => (EntityKind::ProjectDmsf, project_id),
            Task::CreateDmsfFolder { folder_id } => (EntityKind::DmsfFolder, folder_id),
            Task::CreateDocumentFolder { document_id } => (EntityKind::Document, document_id),
            Task::UploadDmsfRevision { revision_id } => (EntityKind::DmsfFileRevision, revision_id),
            Task::UploadDocumentAttachment { attachment_id } => {
                (EntityKind::DocumentAttachment, attachment_id)
            }
        };
        Some(EntityKey::new(kind, id))
    }

    /// The task that materializes `key`
    pub fn for_entity(key: EntityKey) -> Task {
        let id = key.source_id;
        match key.kind {
            EntityKind::Basedir => Task::CreateBasedir,
            EntityKind::Project => Task::CreateProjectFolder { project_id: id },
            EntityKind::ProjectDocs => Task::CreateProjectDocumentsFolder { project_id: id },
            EntityKind::ProjectDmsf => Task::CreateProjectDmsfFolder { project_id: id },
            EntityKind::DmsfFolder => Task::CreateDmsfFolder { folder_id: id },
            EntityKind::Document => Task::CreateDocumentFolder { document_id: id },
            EntityKind::DmsfFileRevision => Task::UploadDmsfRevision { revision_id: id },
            EntityKind::DocumentAttachment => Task::UploadDocumentAttachment { attachment_id: id },
        }
    }

    /// Build from a task name and an optional id argument (CLI form)
    pub fn from_name(name: &str, id: Option<i64>) -> Result<Task> {
        let args = match id {
            Some(id) => {
                let field = match name {
                    "create_project_folder"
                    | "create_project_documents_folder"
                    | "create_project_dmsf_folder" => "project_id",
                    "create_dmsf_folder" => "folder_id",
                    "create_document_folder" => "document_id",
                    "upload_dmsf_revision" => "revision_id",
                    "upload_document_attachment" => "attachment_id",
                    _ => {
                        return Err(MirrorError::InvalidInput(format!(
                            "task {} takes no id",
                            name
                        )))
                    }
                };
                serde_json::json!({ field: id }).to_string()
            }
            None => "{}".to_string(),
        };
        Task::from_parts(name, &args)
    }

    /// Arguments as stored in the queue (the tag lives in `task_name`)
    pub fn args_json(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("task");
        }
        Ok(value.to_string())
    }

    /// Rebuild a task from its queue columns
    pub fn from_parts(task_name: &str, args: &str) -> Result<Task> {
        let mut value: serde_json::Value = serde_json::from_str(args)?;
        let map = value.as_object_mut().ok_or_else(|| {
            MirrorError::Queue(format!("arguments of {} are not an object: {}", task_name, args))
        })?;
        map.insert("task".to_string(), serde_json::Value::from(task_name));
        serde_json::from_value(value)
            .map_err(|e| MirrorError::Queue(format!("invalid task {} {}: {}", task_name, args, e)))
    }

    /// Deduplication and lock key of this task
    pub fn lock_key(&self) -> Result<String> {
        Ok(task_lock_key(self.name(), &self.args_json()?))
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity() {
            Some(key) => write!(f, "{}({})", self.name(), key.source_id),
            None => f.write_str(self.name()),
        }
    }
}

/// Lock key serializing every upload onto one file's remote object
pub fn file_lock_key(file_id: i64) -> String {
    task_lock_key(
        FILE_LOCK_TASK_NAME,
        &serde_json::json!({ "file_id": file_id }).to_string(),
    )
}

/// Why a task gave up its turn without failing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    LockBusy,
    ParentNotReady(EntityKey),
    /// The mapping row was claimed between our read and our insert
    MappingRace,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeferReason::LockBusy => f.write_str("lock busy"),
            DeferReason::ParentNotReady(key) => write!(f, "waiting for {}", key),
            DeferReason::MappingRace => f.write_str("mapping claimed concurrently"),
        }
    }
}

/// Result of one task attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Finished; `mutations` remote create/update calls were made
    Completed { mutations: usize },
    /// Nothing to do (already mapped, or nothing uploadable)
    Skipped(String),
    /// Try again later
    Deferred(DeferReason),
}

impl TaskOutcome {
    pub fn mutations(&self) -> usize {
        match self {
            TaskOutcome::Completed { mutations } => *mutations,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_round_trip_through_queue_columns() {
        for task in [
            Task::SeedTree,
            Task::CreateBasedir,
            Task::CreateDmsfFolder { folder_id: 3 },
            Task::UploadDmsfRevision { revision_id: 42 },
        ] {
            let args = task.args_json().unwrap();
            assert!(!args.contains("task"));
            assert_eq!(Task::from_parts(task.name(), &args).unwrap(), task);
        }
        assert_eq!(
            Task::CreateDmsfFolder { folder_id: 3 }.args_json().unwrap(),
            r#"{"folder_id":3}"#
        );
    }

    #[test]
    fn test_every_kind_has_a_task() {
        for kind in EntityKind::ALL {
            let key = EntityKey::new(kind, 7);
            let key = if kind == EntityKind::Basedir {
                EntityKey::basedir()
            } else {
                key
            };
            assert_eq!(Task::for_entity(key).entity(), Some(key));
        }
        assert_eq!(Task::SeedTree.entity(), None);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(
            Task::from_name("create_project_folder", Some(4)).unwrap(),
            Task::CreateProjectFolder { project_id: 4 }
        );
        assert_eq!(Task::from_name("seed_tree", None).unwrap(), Task::SeedTree);
        assert!(Task::from_name("create_basedir", Some(1)).is_err());
        assert!(Task::from_name("create_dmsf_folder", None).is_err());
        assert!(Task::from_name("nope", None).is_err());
        for name in Task::NAMES {
            assert!(Task::from_name(name, None).is_ok() || Task::from_name(name, Some(1)).is_ok());
        }
    }

    #[test]
    fn test_unknown_task_is_a_queue_error() {
        assert!(matches!(
            Task::from_parts("drop_tables", "{}"),
            Err(MirrorError::Queue(_))
        ));
        assert!(Task::from_parts("create_dmsf_folder", "[1]").is_err());
    }

    #[test]
    fn test_lock_keys() {
        let a = Task::CreateDmsfFolder { folder_id: 3 }.lock_key().unwrap();
        assert!(a.starts_with("create_dmsf_folder-lock-"));
        assert_ne!(a, Task::CreateDmsfFolder { folder_id: 4 }.lock_key().unwrap());
        assert!(file_lock_key(10).starts_with("upload_dmsf_file-lock-"));
    }
}

//! Dependency resolution and task execution
//!
//! A task runs in three steps: take the entity's lock, make sure the
//! remote parent is bound (otherwise enqueue the parent's task and defer),
//! then hand off to the gateway or the uploader. The lock lease is renewed
//! every third of its TTL until the task returns.

use std::sync::Arc;
use std::time::Duration;

use super::{file_lock_key, DeferReason, Task, TaskOutcome, TaskQueue};
use crate::config::MirrorConfig;
use crate::context::MirrorContext;
use crate::error::Result;
use crate::gateway::{GatewayOutcome, ObjectSpec, RemoteGateway};
use crate::lock::{TaskLock, TaskLockGuard};
use crate::source::{require, SourceCatalog};
use crate::storage::{mapping, Storage};
use crate::types::{Attachment, EntityKey, EntityKind};
use crate::uploader::RevisionUploader;

/// Where an entity's remote object goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParentLink {
    /// A fixed remote id (the configured root)
    Remote(String),
    /// The remote object of another entity
    Entity(EntityKey),
}

/// What materializing an entity means
enum Materialize {
    Folder { name: String },
    Revision { file_id: i64, revision_id: i64 },
    Attachment(Attachment),
}

struct Plan {
    parent: ParentLink,
    action: Materialize,
}

/// Executes tasks against one context
#[derive(Clone)]
pub struct Resolver {
    config: MirrorConfig,
    storage: Storage,
    source: Arc<dyn SourceCatalog>,
    locks: Arc<dyn TaskLock>,
    gateway: RemoteGateway,
    uploader: RevisionUploader,
    queue: TaskQueue,
}

impl Resolver {
    pub fn new(ctx: &MirrorContext) -> Self {
        Self {
            config: ctx.config.clone(),
            storage: ctx.storage.clone(),
            source: ctx.source.clone(),
            locks: ctx.locks.clone(),
            gateway: ctx.gateway(),
            uploader: ctx.uploader(),
            queue: ctx.queue(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Remote parent of `key`, following the tree rules
    pub fn parent_of(&self, key: EntityKey) -> Result<ParentLink> {
        Ok(self.plan(key)?.parent)
    }

    fn project_parent(&self, parent_id: Option<i64>, project_id: i64) -> Result<ParentLink> {
        if let Some(parent_id) = parent_id {
            if self.source.project(parent_id)?.is_some() {
                return Ok(ParentLink::Entity(EntityKey::new(EntityKind::Project, parent_id)));
            }
            tracing::warn!(project_id, parent_id, "Parent project not found, treating as root");
        }
        Ok(ParentLink::Entity(EntityKey::basedir()))
    }

    fn folder_parent(&self, folder_id: Option<i64>, project_id: i64) -> Result<ParentLink> {
        if let Some(folder_id) = folder_id {
            let folder = self.source.folder(folder_id)?;
            if folder.is_some_and(|f| f.project_id == project_id) {
                return Ok(ParentLink::Entity(EntityKey::new(EntityKind::DmsfFolder, folder_id)));
            }
            tracing::warn!(project_id, folder_id, "DMSF folder not found, using project root");
        }
        Ok(ParentLink::Entity(EntityKey::new(EntityKind::ProjectDmsf, project_id)))
    }

    fn plan(&self, key: EntityKey) -> Result<Plan> {
        let id = key.source_id;
        let plan = match key.kind {
            EntityKind::Basedir => Plan {
                parent: ParentLink::Remote(self.config.remote_root_id.clone()),
                action: Materialize::Folder {
                    name: self.config.basedir_name.clone(),
                },
            },
            EntityKind::Project => {
                let project = require(self.source.project(id)?, key.kind, id)?;
                Plan {
                    parent: self.project_parent(project.parent_id, project.id)?,
                    action: Materialize::Folder { name: project.name },
                }
            }
            EntityKind::ProjectDocs | EntityKind::ProjectDmsf => {
                require(self.source.project(id)?, EntityKind::Project, id)?;
                let name = if key.kind == EntityKind::ProjectDocs {
                    self.config.documents_folder_name.clone()
                } else {
                    self.config.dmsf_folder_name.clone()
                };
                Plan {
                    parent: ParentLink::Entity(EntityKey::new(EntityKind::Project, id)),
                    action: Materialize::Folder { name },
                }
            }
            EntityKind::DmsfFolder => {
                let folder = require(self.source.folder(id)?, key.kind, id)?;
                Plan {
                    parent: self.folder_parent(folder.parent_id, folder.project_id)?,
                    action: Materialize::Folder { name: folder.title },
                }
            }
            EntityKind::Document => {
                let document = require(self.source.document(id)?, key.kind, id)?;
                Plan {
                    parent: ParentLink::Entity(EntityKey::new(
                        EntityKind::ProjectDocs,
                        document.project_id,
                    )),
                    action: Materialize::Folder {
                        name: document.title,
                    },
                }
            }
            EntityKind::DmsfFileRevision => {
                let revision = require(self.source.revision(id)?, key.kind, id)?;
                // Every revision of a file plans the folder of the one that creates its object
                let placed = self
                    .uploader
                    .lead_revision(revision.file_id)?
                    .unwrap_or_else(|| revision.clone());
                let folder_id = match placed.folder_id {
                    Some(folder_id) => Some(folder_id),
                    None => self.source.file(placed.file_id)?.and_then(|f| f.folder_id),
                };
                Plan {
                    parent: self.folder_parent(folder_id, placed.project_id)?,
                    action: Materialize::Revision {
                        file_id: revision.file_id,
                        revision_id: revision.id,
                    },
                }
            }
            EntityKind::DocumentAttachment => {
                let attachment = require(self.source.attachment(id)?, key.kind, id)?;
                Plan {
                    parent: ParentLink::Entity(EntityKey::new(
                        EntityKind::Document,
                        attachment.document_id,
                    )),
                    action: Materialize::Attachment(attachment),
                }
            }
        };
        Ok(plan)
    }

    fn lock_key_for(&self, task: &Task) -> Result<String> {
        match *task {
            Task::UploadDmsfRevision { revision_id } => {
                let revision = require(
                    self.source.revision(revision_id)?,
                    EntityKind::DmsfFileRevision,
                    revision_id,
                )?;
                Ok(file_lock_key(revision.file_id))
            }
            _ => task.lock_key(),
        }
    }

    /// Run one attempt of `task`
    pub async fn execute(&self, task: &Task) -> Result<TaskOutcome> {
        let Some(key) = task.entity() else {
            return self.seed_tree();
        };

        if let Some(remote_id) = self.gateway.lookup(key)? {
            tracing::debug!(entity = %key, remote_id = %remote_id, "Already mapped");
            return Ok(TaskOutcome::Skipped(format!("{} already mapped", key)));
        }

        let lock_key = self.lock_key_for(task)?;
        let ttl = self.config.lock_ttl();
        let Some(guard) = TaskLockGuard::acquire(&self.locks, lock_key, ttl)? else {
            return Ok(TaskOutcome::Deferred(DeferReason::LockBusy));
        };

        let work = self.execute_locked(key);
        tokio::pin!(work);
        let mut heartbeat = tokio::time::interval((ttl / 3).max(Duration::from_millis(10)));
        heartbeat.tick().await;
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = heartbeat.tick() => match guard.renew() {
                    Ok(true) => tracing::trace!(lock_key = %guard.key(), "Lease renewed"),
                    Ok(false) => tracing::warn!(lock_key = %guard.key(), "Lease lost to another worker"),
                    Err(e) => tracing::warn!(lock_key = %guard.key(), "Lease renewal failed: {}", e),
                },
            }
        }
    }

    async fn execute_locked(&self, key: EntityKey) -> Result<TaskOutcome> {
        let plan = self.plan(key)?;
        let parent_remote_id = match &plan.parent {
            ParentLink::Remote(id) => id.clone(),
            ParentLink::Entity(parent) => match self.gateway.lookup(*parent)? {
                Some(id) => id,
                None => {
                    let parent_task = Task::for_entity(*parent);
                    self.queue.enqueue_unique(&parent_task)?;
                    tracing::info!(entity = %key, parent = %parent, "Parent not mapped yet, deferring");
                    return Ok(TaskOutcome::Deferred(DeferReason::ParentNotReady(*parent)));
                }
            },
        };

        match plan.action {
            Materialize::Folder { name } => {
                let outcome = self
                    .gateway
                    .create_or_find(key, &parent_remote_id, &name, ObjectSpec::Folder)
                    .await?;
                Ok(Self::gateway_outcome(outcome))
            }
            Materialize::Revision {
                file_id,
                revision_id,
            } => {
                let report = self
                    .uploader
                    .sync_file(file_id, Some(revision_id), &parent_remote_id)
                    .await?;
                if report.contended {
                    return Ok(TaskOutcome::Deferred(DeferReason::MappingRace));
                }
                if report.skipped_revisions.contains(&revision_id) {
                    return Ok(TaskOutcome::Skipped(format!(
                        "revision {} is older than the newest pushed version",
                        revision_id
                    )));
                }
                Ok(TaskOutcome::Completed {
                    mutations: report.mutations(),
                })
            }
            Materialize::Attachment(attachment) => {
                let outcome = self
                    .uploader
                    .upload_attachment(&attachment, &parent_remote_id)
                    .await?;
                Ok(Self::gateway_outcome(outcome))
            }
        }
    }

    fn gateway_outcome(outcome: GatewayOutcome) -> TaskOutcome {
        match outcome {
            GatewayOutcome::Contended => TaskOutcome::Deferred(DeferReason::MappingRace),
            GatewayOutcome::Existing(_) | GatewayOutcome::Reconciled(_) => {
                TaskOutcome::Completed { mutations: 0 }
            }
            GatewayOutcome::Created(_) => TaskOutcome::Completed { mutations: 1 },
        }
    }

    /// Enqueue an upload for every unmapped revision and attachment
    fn seed_tree(&self) -> Result<TaskOutcome> {
        let (bound_revisions, bound_attachments) = self.storage.with_connection(|conn| {
            Ok((
                mapping::load_bound(conn, EntityKind::DmsfFileRevision)?,
                mapping::load_bound(conn, EntityKind::DocumentAttachment)?,
            ))
        })?;
        let mut queued = 0;
        for revision in self.source.revisions()? {
            if bound_revisions.contains_key(&revision.id) {
                continue;
            }
            let task = Task::UploadDmsfRevision {
                revision_id: revision.id,
            };
            if self.queue.enqueue_unique(&task)?.is_some() {
                queued += 1;
            }
        }
        for attachment in self.source.attachments()? {
            if bound_attachments.contains_key(&attachment.id) {
                continue;
            }
            let task = Task::UploadDocumentAttachment {
                attachment_id: attachment.id,
            };
            if self.queue.enqueue_unique(&task)?.is_some() {
                queued += 1;
            }
        }
        tracing::info!(queued, "Seeded tree uploads");
        Ok(TaskOutcome::Completed { mutations: 0 })
    }
}

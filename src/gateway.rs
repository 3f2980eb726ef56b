//! Idempotent create-or-find against the remote store
//!
//! Every creation runs the same sequence: claim the mapping row, look for
//! an object with the wanted name under the parent, and only create when
//! none exists. A failed create is followed by another name lookup before
//! the next attempt, so a create whose reply was lost is reconciled rather
//! than duplicated.

use std::sync::Arc;

use crate::config::RemoteRetryPolicy;
use crate::error::{MirrorError, Result};
use crate::remote::retry::{jittered_delay, with_retry};
use crate::remote::{CreateObject, RemoteStore, Upload};
use crate::storage::{mapping, PlaceholderOutcome, Storage};
use crate::types::EntityKey;

/// What to create when no object with the name exists
#[derive(Debug, Clone)]
pub enum ObjectSpec {
    Folder,
    File(Upload),
}

/// How a create-or-find call resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    /// The mapping was already bound; no remote call was made
    Existing(String),
    /// An object with the name already existed remotely and was bound
    Reconciled(String),
    Created(String),
    /// Another worker claimed the row between our read and our insert
    Contended,
}

impl GatewayOutcome {
    pub fn remote_id(&self) -> Option<&str> {
        match self {
            GatewayOutcome::Existing(id)
            | GatewayOutcome::Reconciled(id)
            | GatewayOutcome::Created(id) => Some(id),
            GatewayOutcome::Contended => None,
        }
    }

    pub fn is_mutation(&self) -> bool {
        matches!(self, GatewayOutcome::Created(_))
    }
}

/// Mapping-aware wrapper around a [`RemoteStore`]
#[derive(Clone)]
pub struct RemoteGateway {
    storage: Storage,
    remote: Arc<dyn RemoteStore>,
    policy: RemoteRetryPolicy,
}

impl RemoteGateway {
    pub fn new(storage: Storage, remote: Arc<dyn RemoteStore>, policy: RemoteRetryPolicy) -> Self {
        Self {
            storage,
            remote,
            policy,
        }
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn policy(&self) -> &RemoteRetryPolicy {
        &self.policy
    }

    /// Bound remote id for `key`, if any
    pub fn lookup(&self, key: EntityKey) -> Result<Option<String>> {
        self.storage.with_connection(|conn| mapping::lookup(conn, key))
    }

    /// Record `remote_id` for `key`; only after the object is confirmed remote
    pub fn bind(&self, key: EntityKey, remote_id: &str) -> Result<()> {
        self.storage
            .with_connection(|conn| mapping::bind(conn, key, remote_id))?;
        tracing::debug!(kind = %key.kind, source_id = key.source_id, remote_id, "Mapping bound");
        Ok(())
    }

    /// Claim the mapping row for `key`
    fn claim(&self, key: EntityKey) -> Result<Claim> {
        let existing = self
            .storage
            .with_connection(|conn| mapping::get_entry(conn, key))?;
        match existing {
            Some(entry) => Ok(match entry.remote_id {
                Some(id) => Claim::Bound(id),
                // Left behind by an interrupted attempt; the caller holds the lock
                None => Claim::Owned,
            }),
            None => {
                let outcome = self
                    .storage
                    .with_connection(|conn| mapping::create_placeholder(conn, key))?;
                match outcome {
                    PlaceholderOutcome::Inserted => Ok(Claim::Owned),
                    PlaceholderOutcome::AlreadyExists => {
                        match self.lookup(key)? {
                            Some(id) => Ok(Claim::Bound(id)),
                            None => Ok(Claim::Raced),
                        }
                    }
                }
            }
        }
    }

    /// First child of `parent_id` named `name`, following pagination
    pub async fn find_by_name(&self, parent_id: &str, name: &str) -> Result<Option<String>> {
        let mut page_token: Option<String> = None;
        for _ in 0..self.policy.max_pages.max(1) {
            let token = page_token.as_deref();
            let page = with_retry(&self.policy, "list_children", move || {
                self.remote.list_children(parent_id, name, token)
            })
            .await?;
            if let Some(found) = page.items.into_iter().find(|item| item.name == name) {
                return Ok(Some(found.id));
            }
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => return Ok(None),
            }
        }
        Err(MirrorError::RemoteRejected(format!(
            "listing of '{}' under {} exceeded {} pages",
            name, parent_id, self.policy.max_pages
        )))
    }

    /// Materialize `key` as a child named `name` of `parent_remote_id`
    pub async fn create_or_find(
        &self,
        key: EntityKey,
        parent_remote_id: &str,
        name: &str,
        spec: ObjectSpec,
    ) -> Result<GatewayOutcome> {
        if name.trim().is_empty() {
            return Err(MirrorError::InvalidInput(format!("{} has an empty name", key)));
        }

        match self.claim(key)? {
            Claim::Bound(id) => {
                tracing::debug!(entity = %key, remote_id = %id, "Already mapped");
                return Ok(GatewayOutcome::Existing(id));
            }
            Claim::Raced => {
                tracing::info!(entity = %key, "Mapping claimed concurrently");
                return Ok(GatewayOutcome::Contended);
            }
            Claim::Owned => {}
        }

        let request = match spec {
            ObjectSpec::Folder => CreateObject::folder(parent_remote_id, name),
            ObjectSpec::File(upload) => CreateObject::file(parent_remote_id, name, upload),
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if let Some(existing) = self.find_by_name(parent_remote_id, name).await? {
                tracing::info!(entity = %key, remote_id = %existing, name, "Found remote object, binding");
                self.bind(key, &existing)?;
                return Ok(GatewayOutcome::Reconciled(existing));
            }

            match self.remote.create_object(request.clone()).await {
                Ok(id) => {
                    tracing::info!(
                        entity = %key,
                        remote_id = %id,
                        parent = parent_remote_id,
                        name,
                        folder = request.is_folder(),
                        "Created remote object"
                    );
                    self.bind(key, &id)?;
                    return Ok(GatewayOutcome::Created(id));
                }
                Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = jittered_delay(&self.policy, attempt, e.retry_after_secs());
                    tracing::warn!(
                        entity = %key,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Create failed, re-checking by name: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

enum Claim {
    Bound(String),
    Owned,
    Raced,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{MemoryRemote, RemoteCall, MEMORY_ROOT_ID};
    use crate::types::{EntityKind, FOLDER_MIME_TYPE};

    fn fast_policy() -> RemoteRetryPolicy {
        RemoteRetryPolicy {
            max_attempts: 4,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            max_pages: 50,
        }
    }

    fn setup(remote: MemoryRemote) -> (RemoteGateway, Arc<MemoryRemote>) {
        let remote = Arc::new(remote);
        let gateway = RemoteGateway::new(
            Storage::open_in_memory().unwrap(),
            remote.clone(),
            fast_policy(),
        );
        (gateway, remote)
    }

    #[tokio::test]
    async fn test_creates_then_reuses_mapping() {
        let (gateway, remote) = setup(MemoryRemote::new());
        let key = EntityKey::basedir();

        let first = gateway
            .create_or_find(key, MEMORY_ROOT_ID, "Redmine", ObjectSpec::Folder)
            .await
            .unwrap();
        assert!(first.is_mutation());
        let id = first.remote_id().unwrap().to_string();

        remote.clear_calls();
        let second = gateway
            .create_or_find(key, MEMORY_ROOT_ID, "Redmine", ObjectSpec::Folder)
            .await
            .unwrap();
        assert_eq!(second, GatewayOutcome::Existing(id));
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconciles_existing_name() {
        let (gateway, remote) = setup(MemoryRemote::new().with_page_size(1));
        for i in 0..3 {
            remote.insert_existing(MEMORY_ROOT_ID, &format!("Other {}", i), FOLDER_MIME_TYPE);
        }
        let existing = remote.insert_existing(MEMORY_ROOT_ID, "Specs", FOLDER_MIME_TYPE);

        let key = EntityKey::new(EntityKind::DmsfFolder, 5);
        let outcome = gateway
            .create_or_find(key, MEMORY_ROOT_ID, "Specs", ObjectSpec::Folder)
            .await
            .unwrap();
        assert_eq!(outcome, GatewayOutcome::Reconciled(existing.clone()));
        assert_eq!(remote.mutation_count(), 0);
        assert_eq!(gateway.lookup(key).unwrap(), Some(existing));
    }

    #[tokio::test]
    async fn test_resumes_unbound_placeholder() {
        let (gateway, remote) = setup(MemoryRemote::new());
        let key = EntityKey::new(EntityKind::Project, 1);
        gateway
            .storage
            .with_connection(|conn| mapping::create_placeholder(conn, key))
            .unwrap();

        let outcome = gateway
            .create_or_find(key, MEMORY_ROOT_ID, "Alpha", ObjectSpec::Folder)
            .await
            .unwrap();
        assert!(outcome.is_mutation());
        assert_eq!(remote.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_transient_create_failure_relists_first() {
        let (gateway, remote) = setup(MemoryRemote::new());
        let key = EntityKey::new(EntityKind::Project, 2);
        remote.fail_name_transiently("Beta");
        let err = gateway
            .create_or_find(key, MEMORY_ROOT_ID, "Beta", ObjectSpec::Folder)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let lists = remote
            .calls()
            .iter()
            .filter(|c| matches!(c, RemoteCall::List { .. }))
            .count();
        assert_eq!(lists, fast_policy().max_attempts as usize);
        assert_eq!(gateway.lookup(key).unwrap(), None);
    }

    #[tokio::test]
    async fn test_permanent_failure_leaves_row_unbound() {
        let (gateway, remote) = setup(MemoryRemote::new());
        remote.reject_name("Bad");
        let key = EntityKey::new(EntityKind::Document, 9);
        let err = gateway
            .create_or_find(key, MEMORY_ROOT_ID, "Bad", ObjectSpec::Folder)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::RemoteRejected(_)));
        assert_eq!(gateway.lookup(key).unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_name_is_invalid() {
        let (gateway, _) = setup(MemoryRemote::new());
        let err = gateway
            .create_or_find(EntityKey::basedir(), MEMORY_ROOT_ID, " ", ObjectSpec::Folder)
            .await
            .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidInput(_)));
    }
}

//! In-memory remote store with a call log

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ChildPage, CreateObject, RemoteObject, RemoteStore, Upload};
use crate::error::{MirrorError, Result};
use crate::types::FOLDER_MIME_TYPE;

/// Id of the pre-existing root container
pub const MEMORY_ROOT_ID: &str = "root";

/// One logged call, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    List {
        parent_id: String,
        name: String,
    },
    Create {
        parent_id: String,
        name: String,
        object_id: String,
    },
    Update {
        object_id: String,
        version: i64,
        revision_id: String,
    },
}

impl RemoteCall {
    pub fn is_mutation(&self) -> bool {
        !matches!(self, RemoteCall::List { .. })
    }
}

/// A stored object and its pushed versions
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub id: String,
    pub name: String,
    pub parent_id: Option<String>,
    pub mime_type: String,
    /// Version numbers in push order
    pub versions: Vec<i64>,
    pub descriptions: Vec<Option<String>>,
    pub size: u64,
}

impl StoredObject {
    fn as_child(&self) -> RemoteObject {
        RemoteObject {
            id: self.id.clone(),
            name: self.name.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

/// Deterministic remote store for tests and benches.
///
/// Creation under an unknown parent is rejected, so a child created before
/// its parent surfaces as an error instead of a silently orphaned object.
pub struct MemoryRemote {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    calls: Mutex<Vec<RemoteCall>>,
    next_id: AtomicU64,
    page_size: usize,
    latency: Option<Duration>,
    transient_failures: AtomicU32,
    flaky_names: Mutex<HashSet<String>>,
    rejected_names: Mutex<HashSet<String>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            MEMORY_ROOT_ID.to_string(),
            StoredObject {
                id: MEMORY_ROOT_ID.to_string(),
                name: "My Drive".to_string(),
                parent_id: None,
                mime_type: FOLDER_MIME_TYPE.to_string(),
                versions: Vec::new(),
                descriptions: Vec::new(),
                size: 0,
            },
        );
        Self {
            objects: Mutex::new(objects),
            calls: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            page_size: 100,
            latency: None,
            transient_failures: AtomicU32::new(0),
            flaky_names: Mutex::new(HashSet::new()),
            rejected_names: Mutex::new(HashSet::new()),
        }
    }

    /// Items per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Sleep this long inside every call so concurrent workers interleave
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The next `count` calls of any kind fail transiently
    pub fn fail_next(&self, count: u32) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    /// Creates with this name always fail transiently
    pub fn fail_name_transiently(&self, name: &str) {
        self.flaky_names.lock().insert(name.to_string());
    }

    /// Creates with this name are rejected permanently
    pub fn reject_name(&self, name: &str) {
        self.rejected_names.lock().insert(name.to_string());
    }

    /// Seed an object created out of band; returns its id
    pub fn insert_existing(&self, parent_id: &str, name: &str, mime_type: &str) -> String {
        let id = self.allocate_id("obj");
        self.objects.lock().insert(
            id.clone(),
            StoredObject {
                id: id.clone(),
                name: name.to_string(),
                parent_id: Some(parent_id.to_string()),
                mime_type: mime_type.to_string(),
                versions: Vec::new(),
                descriptions: Vec::new(),
                size: 0,
            },
        );
        id
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.calls.lock().iter().filter(|c| c.is_mutation()).count()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn object(&self, id: &str) -> Option<StoredObject> {
        self.objects.lock().get(id).cloned()
    }

    /// Number of objects, excluding the root
    pub fn object_count(&self) -> usize {
        self.objects.lock().len() - 1
    }

    pub fn children_named(&self, parent_id: &str, name: &str) -> Vec<StoredObject> {
        self.objects
            .lock()
            .values()
            .filter(|o| o.parent_id.as_deref() == Some(parent_id) && o.name == name)
            .cloned()
            .collect()
    }

    /// Path of names from the root to `id`, excluding the root itself
    pub fn path_of(&self, id: &str) -> Vec<String> {
        let objects = self.objects.lock();
        let mut path = Vec::new();
        let mut current = objects.get(id);
        while let Some(object) = current {
            if object.id == MEMORY_ROOT_ID {
                break;
            }
            path.push(object.name.clone());
            current = object.parent_id.as_deref().and_then(|p| objects.get(p));
        }
        path.reverse();
        path
    }

    fn allocate_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn enter(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(MirrorError::Remote("injected transient failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn list_children(
        &self,
        parent_id: &str,
        name: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage> {
        self.enter().await?;
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| MirrorError::RemoteRejected(format!("bad page token {}", token)))?,
            None => 0,
        };

        let matches: Vec<RemoteObject> = self
            .objects
            .lock()
            .values()
            .filter(|o| o.parent_id.as_deref() == Some(parent_id) && o.name == name)
            .map(StoredObject::as_child)
            .collect();
        self.calls.lock().push(RemoteCall::List {
            parent_id: parent_id.to_string(),
            name: name.to_string(),
        });

        let end = (offset + self.page_size).min(matches.len());
        let items = matches.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_page_token = (end < matches.len()).then(|| end.to_string());
        Ok(ChildPage {
            items,
            next_page_token,
        })
    }

    async fn create_object(&self, request: CreateObject) -> Result<String> {
        self.enter().await?;
        if self.rejected_names.lock().contains(&request.name) {
            return Err(MirrorError::RemoteRejected(format!(
                "name not allowed: {}",
                request.name
            )));
        }
        if self.flaky_names.lock().contains(&request.name) {
            return Err(MirrorError::Remote(format!(
                "backend error creating {}",
                request.name
            )));
        }

        let id = self.allocate_id("obj");
        let mut objects = self.objects.lock();
        if !objects.contains_key(&request.parent_id) {
            return Err(MirrorError::RemoteRejected(format!(
                "parent {} does not exist",
                request.parent_id
            )));
        }
        let (versions, descriptions, size) = match &request.upload {
            Some(upload) => (
                vec![upload.metadata.version],
                vec![upload.metadata.description.clone()],
                upload.bytes.len() as u64,
            ),
            None => (Vec::new(), Vec::new(), 0),
        };
        objects.insert(
            id.clone(),
            StoredObject {
                id: id.clone(),
                name: request.name.clone(),
                parent_id: Some(request.parent_id.clone()),
                mime_type: request.mime_type.clone(),
                versions,
                descriptions,
                size,
            },
        );
        // Logged under the object lock so log order matches creation order
        self.calls.lock().push(RemoteCall::Create {
            parent_id: request.parent_id,
            name: request.name,
            object_id: id.clone(),
        });
        Ok(id)
    }

    async fn update_object_content(&self, object_id: &str, upload: Upload) -> Result<String> {
        self.enter().await?;
        let revision_id = self.allocate_id("rev");
        let mut objects = self.objects.lock();
        let object = objects
            .get_mut(object_id)
            .ok_or_else(|| MirrorError::RemoteRejected(format!("unknown object {}", object_id)))?;
        object.versions.push(upload.metadata.version);
        object.descriptions.push(upload.metadata.description.clone());
        object.size = upload.bytes.len() as u64;
        object.mime_type = upload.mime_type;
        self.calls.lock().push(RemoteCall::Update {
            object_id: object_id.to_string(),
            version: upload.metadata.version,
            revision_id: revision_id.clone(),
        });
        Ok(revision_id)
    }
}

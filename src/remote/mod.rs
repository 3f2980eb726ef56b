//! Hierarchical remote object store
//!
//! Three calls cover everything the engine does remotely: a name-filtered,
//! paginated child listing, object creation under one parent, and a new
//! content version on an existing object. Any of them may fail transiently;
//! callers wrap them in [`retry::with_retry`].

#[cfg(feature = "drive")]
mod drive;
mod memory;
pub mod retry;

#[cfg(feature = "drive")]
pub use drive::{escape_query_value, DriveConfig, DriveRemote};
pub use memory::{MemoryRemote, RemoteCall, StoredObject, MEMORY_ROOT_ID};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::FOLDER_MIME_TYPE;

/// A child returned by a listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub mime_type: String,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildPage {
    pub items: Vec<RemoteObject>,
    pub next_page_token: Option<String>,
}

/// Version attributes pushed with content
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub modified: Option<DateTime<Utc>>,
    pub description: Option<String>,
    /// `major * 10000 + minor`
    pub version: i64,
}

/// Content attached to a create or update call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub metadata: VersionMetadata,
}

/// Create request; `upload` is `None` for folders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateObject {
    pub parent_id: String,
    pub name: String,
    pub mime_type: String,
    pub upload: Option<Upload>,
}

impl CreateObject {
    pub fn folder(parent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            name: name.into(),
            mime_type: FOLDER_MIME_TYPE.to_string(),
            upload: None,
        }
    }

    pub fn file(parent_id: impl Into<String>, name: impl Into<String>, upload: Upload) -> Self {
        Self {
            parent_id: parent_id.into(),
            name: name.into(),
            mime_type: upload.mime_type.clone(),
            upload: Some(upload),
        }
    }

    pub fn is_folder(&self) -> bool {
        self.upload.is_none()
    }
}

/// The remote store collaborator
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Children of `parent_id` whose name equals `name`
    async fn list_children(
        &self,
        parent_id: &str,
        name: &str,
        page_token: Option<&str>,
    ) -> Result<ChildPage>;

    /// Create an object with `parent_id` as its sole parent; returns its id
    async fn create_object(&self, request: CreateObject) -> Result<String>;

    /// Push a new content version; returns the new remote revision id
    async fn update_object_content(&self, object_id: &str, upload: Upload) -> Result<String>;
}

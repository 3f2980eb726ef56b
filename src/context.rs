//! Explicit collaborator bundle passed to every mode

use std::sync::Arc;

use crate::config::MirrorConfig;
use crate::gateway::RemoteGateway;
use crate::lock::TaskLock;
use crate::remote::RemoteStore;
use crate::source::{ContentLocator, SourceCatalog};
use crate::storage::Storage;
use crate::tasks::TaskQueue;
use crate::uploader::RevisionUploader;

/// Everything an engine run touches; cheap to clone
#[derive(Clone)]
pub struct MirrorContext {
    pub config: MirrorConfig,
    pub storage: Storage,
    pub source: Arc<dyn SourceCatalog>,
    pub content: Arc<dyn ContentLocator>,
    pub remote: Arc<dyn RemoteStore>,
    pub locks: Arc<dyn TaskLock>,
}

impl MirrorContext {
    pub fn new(
        config: MirrorConfig,
        storage: Storage,
        source: Arc<dyn SourceCatalog>,
        content: Arc<dyn ContentLocator>,
        remote: Arc<dyn RemoteStore>,
        locks: Arc<dyn TaskLock>,
    ) -> Self {
        Self {
            config,
            storage,
            source,
            content,
            remote,
            locks,
        }
    }

    pub fn gateway(&self) -> RemoteGateway {
        RemoteGateway::new(
            self.storage.clone(),
            self.remote.clone(),
            self.config.remote_retry,
        )
    }

    pub fn uploader(&self) -> RevisionUploader {
        RevisionUploader::new(
            self.gateway(),
            self.storage.clone(),
            self.source.clone(),
            self.content.clone(),
        )
    }

    pub fn queue(&self) -> TaskQueue {
        TaskQueue::new(self.storage.clone())
    }
}

//! Batch mode: load the whole forest, then walk it once, parents first
//!
//! The forest lives in index-addressed arenas. Parent links are resolved
//! after every row is loaded; a parent id that points at an unknown row (or
//! closes a cycle) turns the row into a root of its forest. Only subtrees
//! holding at least one uploadable leaf are materialized.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::MirrorConfig;
use crate::context::MirrorContext;
use crate::error::Result;
use crate::gateway::{GatewayOutcome, ObjectSpec, RemoteGateway};
use crate::source::{ContentLocator, SourceCatalog};
use crate::storage::{mapping, Storage};
use crate::types::{Attachment, DmsfFile, DmsfFolder, Document, EntityKey, EntityKind, Project};
use crate::uploader::RevisionUploader;

/// An entity the walk could not materialize
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub entity: EntityKey,
    pub error: String,
}

/// Totals of one batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub created: usize,
    pub reconciled: usize,
    /// Already bound before the run
    pub existing: usize,
    pub versions_pushed: usize,
    /// Revisions older than the newest version already pushed
    pub stale_revisions: usize,
    /// Files and attachments without local content
    pub no_content: usize,
    /// Entities below a container that failed
    pub skipped: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    /// Remote create/update calls issued
    pub fn mutations(&self) -> usize {
        self.created + self.versions_pushed
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, outcome: &GatewayOutcome) {
        match outcome {
            GatewayOutcome::Created(_) => self.created += 1,
            GatewayOutcome::Reconciled(_) => self.reconciled += 1,
            GatewayOutcome::Existing(_) => self.existing += 1,
            GatewayOutcome::Contended => {}
        }
    }

    fn fail(&mut self, entity: EntityKey, error: String) {
        tracing::error!(entity = %entity, "Batch step failed: {}", error);
        self.failures.push(BatchFailure { entity, error });
    }
}

// =============================================================================
// Forest
// =============================================================================

struct ProjectNode {
    project: Project,
    parent: Option<usize>,
    children: Vec<usize>,
    /// Folders at the project's DMSF root
    folders: Vec<usize>,
    /// Files at the project's DMSF root
    files: Vec<usize>,
    documents: Vec<usize>,
    dmsf_content: bool,
    docs_content: bool,
    has_content: bool,
}

struct FolderNode {
    folder: DmsfFolder,
    parent: Option<usize>,
    children: Vec<usize>,
    files: Vec<usize>,
    has_content: bool,
}

struct FileNode {
    file: DmsfFile,
    /// Revisions with local content, in version order
    revisions: Vec<i64>,
}

impl FileNode {
    fn uploadable(&self) -> bool {
        !self.revisions.is_empty()
    }
}

struct DocumentNode {
    document: Document,
    attachments: Vec<Attachment>,
}

impl DocumentNode {
    fn has_content(&self) -> bool {
        !self.attachments.is_empty()
    }
}

#[derive(Default)]
struct Forest {
    projects: Vec<ProjectNode>,
    folders: Vec<FolderNode>,
    files: Vec<FileNode>,
    documents: Vec<DocumentNode>,
    roots: Vec<usize>,
    /// Leaves dropped for lack of local content
    no_content: usize,
}

/// Nodes not reachable from `roots`, one per parent cycle
fn cycle_roots(count: usize, roots: &[usize], children: impl Fn(usize) -> Vec<usize>) -> Vec<usize> {
    let mut seen = vec![false; count];
    let mark = |start: usize, seen: &mut Vec<bool>| {
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            if !seen[idx] {
                seen[idx] = true;
                stack.extend(children(idx));
            }
        }
    };
    for &root in roots {
        mark(root, &mut seen);
    }
    let mut extra = Vec::new();
    for idx in 0..count {
        if !seen[idx] {
            extra.push(idx);
            mark(idx, &mut seen);
        }
    }
    extra
}

impl Forest {
    fn load(
        source: &dyn SourceCatalog,
        content: &dyn ContentLocator,
        uploader: &RevisionUploader,
    ) -> Result<Self> {
        let mut forest = Forest::default();

        let mut project_index = HashMap::new();
        for project in source.projects()? {
            project_index.insert(project.id, forest.projects.len());
            forest.projects.push(ProjectNode {
                project,
                parent: None,
                children: Vec::new(),
                folders: Vec::new(),
                files: Vec::new(),
                documents: Vec::new(),
                dmsf_content: false,
                docs_content: false,
                has_content: false,
            });
        }

        for idx in 0..forest.projects.len() {
            let project = &forest.projects[idx].project;
            let (project_id, parent_id) = (project.id, project.parent_id);
            match parent_id.and_then(|id| project_index.get(&id).copied()) {
                Some(parent) if parent != idx => {
                    forest.projects[idx].parent = Some(parent);
                    forest.projects[parent].children.push(idx);
                }
                _ => {
                    if let Some(parent_id) = parent_id {
                        tracing::warn!(project_id, parent_id, "Unknown parent project, treating as root");
                    }
                    forest.roots.push(idx);
                }
            }
        }
        let cyclic = cycle_roots(forest.projects.len(), &forest.roots, |idx| {
            forest.projects[idx].children.clone()
        });
        for idx in cyclic {
            tracing::warn!(project_id = forest.projects[idx].project.id, "Project parent cycle, treating as root");
            if let Some(parent) = forest.projects[idx].parent.take() {
                forest.projects[parent].children.retain(|&child| child != idx);
            }
            forest.roots.push(idx);
        }

        let mut folder_index = HashMap::new();
        for project_idx in 0..forest.projects.len() {
            let project_id = forest.projects[project_idx].project.id;
            for folder in source.folders_in_project(project_id)? {
                folder_index.insert(folder.id, (forest.folders.len(), project_idx));
                forest.folders.push(FolderNode {
                    folder,
                    parent: None,
                    children: Vec::new(),
                    files: Vec::new(),
                    has_content: false,
                });
            }
        }
        let mut folder_roots = Vec::new();
        for idx in 0..forest.folders.len() {
            let folder = &forest.folders[idx].folder;
            let (folder_id, parent_id, project_id) = (folder.id, folder.parent_id, folder.project_id);
            let project_idx = folder_index.get(&folder_id).map(|&(_, p)| p).unwrap_or_default();
            let parent = parent_id
                .and_then(|id| folder_index.get(&id).copied())
                .filter(|&(parent, parent_project)| parent != idx && parent_project == project_idx);
            match parent {
                Some((parent, _)) => {
                    forest.folders[idx].parent = Some(parent);
                    forest.folders[parent].children.push(idx);
                }
                None => {
                    if let Some(parent_id) = parent_id {
                        tracing::warn!(folder_id, parent_id, project_id, "Unknown parent folder, using project root");
                    }
                    forest.projects[project_idx].folders.push(idx);
                    folder_roots.push(idx);
                }
            }
        }
        let cyclic = cycle_roots(forest.folders.len(), &folder_roots, |idx| {
            forest.folders[idx].children.clone()
        });
        for idx in cyclic {
            tracing::warn!(folder_id = forest.folders[idx].folder.id, "Folder parent cycle, using project root");
            if let Some(parent) = forest.folders[idx].parent.take() {
                forest.folders[parent].children.retain(|&child| child != idx);
            }
            let project_idx = folder_index
                .get(&forest.folders[idx].folder.id)
                .map(|&(_, p)| p)
                .unwrap_or_default();
            forest.projects[project_idx].folders.push(idx);
        }

        for project_idx in 0..forest.projects.len() {
            let project_id = forest.projects[project_idx].project.id;
            for file in source.files_in_project(project_id)? {
                let uploadable = uploader.uploadable_revisions(file.id)?;
                // The first uploadable revision creates the object, so its folder places the file
                let folder_id = uploadable
                    .first()
                    .and_then(|(revision, _)| revision.folder_id)
                    .or(file.folder_id);
                let revisions: Vec<i64> = uploadable.iter().map(|(revision, _)| revision.id).collect();
                let file_idx = forest.files.len();
                let folder = folder_id
                    .and_then(|id| folder_index.get(&id).copied())
                    .filter(|&(_, p)| p == project_idx)
                    .map(|(idx, _)| idx);
                match folder {
                    Some(folder_idx) => forest.folders[folder_idx].files.push(file_idx),
                    None => {
                        if let Some(folder_id) = folder_id {
                            tracing::warn!(file_id = file.id, folder_id, "Unknown folder, using project root");
                        }
                        forest.projects[project_idx].files.push(file_idx);
                    }
                }
                if revisions.is_empty() {
                    tracing::debug!(file_id = file.id, "No local content for any revision");
                    forest.no_content += 1;
                } else if let Some(folder_idx) = folder {
                    forest.mark_folder(folder_idx);
                }
                forest.files.push(FileNode { file, revisions });
            }

            for document in source.documents_in_project(project_id)? {
                let mut attachments = Vec::new();
                for attachment in source.attachments_of_document(document.id)? {
                    if content.locate_attachment(&attachment)?.is_some() {
                        attachments.push(attachment);
                    } else {
                        tracing::debug!(attachment_id = attachment.id, "No local content for attachment");
                        forest.no_content += 1;
                    }
                }
                forest.projects[project_idx].documents.push(forest.documents.len());
                forest.documents.push(DocumentNode {
                    document,
                    attachments,
                });
            }
        }

        for idx in 0..forest.projects.len() {
            let node = &forest.projects[idx];
            let dmsf = node.folders.iter().any(|&f| forest.folders[f].has_content)
                || node.files.iter().any(|&f| forest.files[f].uploadable());
            let docs = node.documents.iter().any(|&d| forest.documents[d].has_content());
            forest.projects[idx].dmsf_content = dmsf;
            forest.projects[idx].docs_content = docs;
            if dmsf || docs {
                forest.mark_project(idx);
            }
        }

        forest.sort();
        Ok(forest)
    }

    fn mark_folder(&mut self, idx: usize) {
        let mut current = Some(idx);
        while let Some(idx) = current {
            if self.folders[idx].has_content {
                break;
            }
            self.folders[idx].has_content = true;
            current = self.folders[idx].parent;
        }
    }

    fn mark_project(&mut self, idx: usize) {
        let mut current = Some(idx);
        while let Some(idx) = current {
            if self.projects[idx].has_content {
                break;
            }
            self.projects[idx].has_content = true;
            current = self.projects[idx].parent;
        }
    }

    /// Children in display-name order, so the walk is deterministic
    fn sort(&mut self) {
        let project_names: Vec<String> = self.projects.iter().map(|p| p.project.name.clone()).collect();
        let folder_names: Vec<String> = self.folders.iter().map(|f| f.folder.title.clone()).collect();
        let file_names: Vec<String> = self.files.iter().map(|f| f.file.name.clone()).collect();
        let document_names: Vec<String> = self.documents.iter().map(|d| d.document.title.clone()).collect();

        self.roots
            .sort_by(|&a, &b| project_names[a].cmp(&project_names[b]).then(a.cmp(&b)));
        for node in &mut self.projects {
            node.children
                .sort_by(|&a, &b| project_names[a].cmp(&project_names[b]).then(a.cmp(&b)));
            node.folders
                .sort_by(|&a, &b| folder_names[a].cmp(&folder_names[b]).then(a.cmp(&b)));
            node.files
                .sort_by(|&a, &b| file_names[a].cmp(&file_names[b]).then(a.cmp(&b)));
            node.documents
                .sort_by(|&a, &b| document_names[a].cmp(&document_names[b]).then(a.cmp(&b)));
        }
        for node in &mut self.folders {
            node.children
                .sort_by(|&a, &b| folder_names[a].cmp(&folder_names[b]).then(a.cmp(&b)));
            node.files
                .sort_by(|&a, &b| file_names[a].cmp(&file_names[b]).then(a.cmp(&b)));
        }
    }

    fn project_below(&self, idx: usize) -> usize {
        let node = &self.projects[idx];
        let children: usize = node
            .children
            .iter()
            .filter(|&&c| self.projects[c].has_content)
            .map(|&c| 1 + self.project_below(c))
            .sum();
        let dmsf = if node.dmsf_content { 1 + self.dmsf_below(idx) } else { 0 };
        let docs = if node.docs_content { 1 + self.docs_below(idx) } else { 0 };
        children + dmsf + docs
    }

    fn dmsf_below(&self, idx: usize) -> usize {
        let node = &self.projects[idx];
        self.folders_below(&node.folders) + self.uploadable_files(&node.files)
    }

    fn docs_below(&self, idx: usize) -> usize {
        self.projects[idx]
            .documents
            .iter()
            .map(|&d| &self.documents[d])
            .filter(|d| d.has_content())
            .map(|d| 1 + d.attachments.len())
            .sum()
    }

    fn folder_below(&self, idx: usize) -> usize {
        let node = &self.folders[idx];
        self.folders_below(&node.children) + self.uploadable_files(&node.files)
    }

    fn folders_below(&self, folders: &[usize]) -> usize {
        folders
            .iter()
            .filter(|&&f| self.folders[f].has_content)
            .map(|&f| 1 + self.folder_below(f))
            .sum()
    }

    fn uploadable_files(&self, files: &[usize]) -> usize {
        files.iter().filter(|&&f| self.files[f].uploadable()).count()
    }
}

// =============================================================================
// Walker
// =============================================================================

enum Step {
    Project { idx: usize, parent: String },
    Docs { idx: usize, parent: String },
    Dmsf { idx: usize, parent: String },
    Folder { idx: usize, parent: String },
    File { idx: usize, parent: String },
    Document { idx: usize, parent: String },
    Attachment { document: usize, position: usize, parent: String },
}

/// Single-process, lock-free tree walk
pub struct BatchWalker {
    config: MirrorConfig,
    storage: Storage,
    source: Arc<dyn SourceCatalog>,
    content: Arc<dyn ContentLocator>,
    gateway: RemoteGateway,
    uploader: RevisionUploader,
}

impl BatchWalker {
    pub fn new(ctx: &MirrorContext) -> Self {
        Self {
            config: ctx.config.clone(),
            storage: ctx.storage.clone(),
            source: ctx.source.clone(),
            content: ctx.content.clone(),
            gateway: ctx.gateway(),
            uploader: ctx.uploader(),
        }
    }

    /// Mirror every entity with uploadable content
    pub async fn run(&self) -> Result<BatchReport> {
        let bound = self.storage.with_connection(mapping::load_all_bound)?;
        let forest = Forest::load(self.source.as_ref(), self.content.as_ref(), &self.uploader)?;
        tracing::info!(
            projects = forest.projects.len(),
            folders = forest.folders.len(),
            files = forest.files.len(),
            documents = forest.documents.len(),
            bound = bound.len(),
            "Forest loaded"
        );

        let mut report = BatchReport {
            no_content: forest.no_content,
            ..Default::default()
        };
        let roots: Vec<usize> = forest
            .roots
            .iter()
            .copied()
            .filter(|&idx| forest.projects[idx].has_content)
            .collect();
        if roots.is_empty() {
            tracing::info!("Nothing to mirror");
            return Ok(report);
        }

        let Some(basedir) = self
            .ensure_folder(
                &bound,
                EntityKey::basedir(),
                &self.config.remote_root_id,
                &self.config.basedir_name,
                &mut report,
            )
            .await
        else {
            report.skipped += roots.iter().map(|&r| 1 + forest.project_below(r)).sum::<usize>();
            return Ok(report);
        };

        let mut stack: Vec<Step> = roots
            .iter()
            .rev()
            .map(|&idx| Step::Project {
                idx,
                parent: basedir.clone(),
            })
            .collect();

        while let Some(step) = stack.pop() {
            match step {
                Step::Project { idx, parent } => {
                    let node = &forest.projects[idx];
                    let key = EntityKey::new(EntityKind::Project, node.project.id);
                    let Some(remote_id) = self
                        .ensure_folder(&bound, key, &parent, &node.project.name, &mut report)
                        .await
                    else {
                        report.skipped += forest.project_below(idx);
                        continue;
                    };
                    for &child in node.children.iter().rev() {
                        if forest.projects[child].has_content {
                            stack.push(Step::Project {
                                idx: child,
                                parent: remote_id.clone(),
                            });
                        }
                    }
                    if node.dmsf_content {
                        stack.push(Step::Dmsf {
                            idx,
                            parent: remote_id.clone(),
                        });
                    }
                    if node.docs_content {
                        stack.push(Step::Docs {
                            idx,
                            parent: remote_id,
                        });
                    }
                }
                Step::Docs { idx, parent } => {
                    let node = &forest.projects[idx];
                    let key = EntityKey::new(EntityKind::ProjectDocs, node.project.id);
                    let Some(remote_id) = self
                        .ensure_folder(&bound, key, &parent, &self.config.documents_folder_name, &mut report)
                        .await
                    else {
                        report.skipped += forest.docs_below(idx);
                        continue;
                    };
                    for &document in node.documents.iter().rev() {
                        if forest.documents[document].has_content() {
                            stack.push(Step::Document {
                                idx: document,
                                parent: remote_id.clone(),
                            });
                        }
                    }
                }
                Step::Dmsf { idx, parent } => {
                    let node = &forest.projects[idx];
                    let key = EntityKey::new(EntityKind::ProjectDmsf, node.project.id);
                    let Some(remote_id) = self
                        .ensure_folder(&bound, key, &parent, &self.config.dmsf_folder_name, &mut report)
                        .await
                    else {
                        report.skipped += forest.dmsf_below(idx);
                        continue;
                    };
                    Self::push_folder_contents(&forest, &node.folders, &node.files, &remote_id, &mut stack);
                }
                Step::Folder { idx, parent } => {
                    let node = &forest.folders[idx];
                    let key = EntityKey::new(EntityKind::DmsfFolder, node.folder.id);
                    let Some(remote_id) = self
                        .ensure_folder(&bound, key, &parent, &node.folder.title, &mut report)
                        .await
                    else {
                        report.skipped += forest.folder_below(idx);
                        continue;
                    };
                    Self::push_folder_contents(&forest, &node.children, &node.files, &remote_id, &mut stack);
                }
                Step::Document { idx, parent } => {
                    let node = &forest.documents[idx];
                    let key = EntityKey::new(EntityKind::Document, node.document.id);
                    let Some(remote_id) = self
                        .ensure_folder(&bound, key, &parent, &node.document.title, &mut report)
                        .await
                    else {
                        report.skipped += node.attachments.len();
                        continue;
                    };
                    for position in (0..node.attachments.len()).rev() {
                        stack.push(Step::Attachment {
                            document: idx,
                            position,
                            parent: remote_id.clone(),
                        });
                    }
                }
                Step::File { idx, parent } => {
                    self.sync_file(&forest.files[idx], &bound, &parent, &mut report)
                        .await;
                }
                Step::Attachment {
                    document,
                    position,
                    parent,
                } => {
                    let attachment = &forest.documents[document].attachments[position];
                    let key = EntityKey::new(EntityKind::DocumentAttachment, attachment.id);
                    if bound.contains_key(&key) {
                        report.existing += 1;
                        continue;
                    }
                    match self.uploader.upload_attachment(attachment, &parent).await {
                        Ok(GatewayOutcome::Contended) => {
                            report.fail(key, "mapping claimed concurrently".to_string())
                        }
                        Ok(outcome) => report.record(&outcome),
                        Err(e) => report.fail(key, e.to_string()),
                    }
                }
            }
        }

        tracing::info!(
            created = report.created,
            reconciled = report.reconciled,
            existing = report.existing,
            versions_pushed = report.versions_pushed,
            skipped = report.skipped,
            failures = report.failures.len(),
            "Batch run finished"
        );
        Ok(report)
    }

    fn push_folder_contents(
        forest: &Forest,
        folders: &[usize],
        files: &[usize],
        parent: &str,
        stack: &mut Vec<Step>,
    ) {
        for &file in files.iter().rev() {
            if forest.files[file].uploadable() {
                stack.push(Step::File {
                    idx: file,
                    parent: parent.to_string(),
                });
            }
        }
        for &folder in folders.iter().rev() {
            if forest.folders[folder].has_content {
                stack.push(Step::Folder {
                    idx: folder,
                    parent: parent.to_string(),
                });
            }
        }
    }

    /// Bound id of a container, creating or reconciling it when needed.
    /// `None` means the step failed and was recorded.
    async fn ensure_folder(
        &self,
        bound: &HashMap<EntityKey, String>,
        key: EntityKey,
        parent: &str,
        name: &str,
        report: &mut BatchReport,
    ) -> Option<String> {
        if let Some(remote_id) = bound.get(&key) {
            report.existing += 1;
            return Some(remote_id.clone());
        }
        match self
            .gateway
            .create_or_find(key, parent, name, ObjectSpec::Folder)
            .await
        {
            Ok(GatewayOutcome::Contended) => {
                report.fail(key, "mapping claimed concurrently".to_string());
                None
            }
            Ok(outcome) => {
                report.record(&outcome);
                outcome.remote_id().map(str::to_string)
            }
            Err(e) => {
                report.fail(key, e.to_string());
                None
            }
        }
    }

    async fn sync_file(
        &self,
        node: &FileNode,
        bound: &HashMap<EntityKey, String>,
        parent: &str,
        report: &mut BatchReport,
    ) {
        let keys: Vec<EntityKey> = node
            .revisions
            .iter()
            .map(|&id| EntityKey::new(EntityKind::DmsfFileRevision, id))
            .collect();
        let Some(&lead) = keys.first() else {
            return;
        };
        if keys.iter().all(|key| bound.contains_key(key)) {
            report.existing += 1;
            return;
        }
        match self.uploader.sync_file(node.file.id, None, parent).await {
            Ok(file) if file.contended => report.fail(lead, "mapping claimed concurrently".to_string()),
            Ok(file) => {
                report.created += usize::from(file.created);
                report.reconciled += usize::from(file.reconciled);
                report.versions_pushed += file.versions_pushed;
                report.stale_revisions += file.skipped_revisions.len();
            }
            Err(e) => report.fail(lead, e.to_string()),
        }
    }
}

//! Incremental mode, end to end: queue, locks, resolver and worker pools
//! against in-memory source and remote.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use treemirror::config::{RemoteRetryPolicy, TaskRetryPolicy};
use treemirror::lock::SqliteTaskLock;
use treemirror::remote::{MemoryRemote, RemoteCall, MEMORY_ROOT_ID};
use treemirror::source::{MemoryContentLocator, MemorySource};
use treemirror::storage::mapping;
use treemirror::types::FOLDER_MIME_TYPE;
use treemirror::{EntityKey, EntityKind, MirrorConfig, MirrorContext, Storage, Task, WorkerPool};

struct Harness {
    ctx: MirrorContext,
    remote: Arc<MemoryRemote>,
}

fn harness(source: MemorySource, remote: MemoryRemote, content: MemoryContentLocator) -> Harness {
    let mut config = MirrorConfig::default();
    config.task_retry = TaskRetryPolicy {
        base_delay_ms: 1,
        step_ms: 1,
        max_delay_ms: 5,
        max_retries: 200,
    };
    config.remote_retry = RemoteRetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 2,
        max_pages: 50,
    };
    config.workers.concurrency = 4;
    config.workers.poll_interval_ms = 2;

    let storage = Storage::open_in_memory().unwrap();
    let remote = Arc::new(remote);
    let ctx = MirrorContext::new(
        config,
        storage.clone(),
        Arc::new(source),
        Arc::new(content),
        remote.clone(),
        Arc::new(SqliteTaskLock::new(storage)),
    );
    Harness { ctx, remote }
}

impl Harness {
    fn enqueue(&self, task: Task) {
        self.ctx.queue().enqueue(&task, Duration::ZERO).unwrap();
    }

    fn lookup(&self, kind: EntityKind, id: i64) -> Option<String> {
        self.ctx
            .storage
            .with_connection(|conn| mapping::lookup(conn, EntityKey::new(kind, id)))
            .unwrap()
    }

    fn bound_rows(&self) -> i64 {
        self.ctx.storage.with_connection(mapping::count_bound).unwrap()
    }

    async fn drain(&self) -> treemirror::tasks::PoolReport {
        WorkerPool::new(&self.ctx).run_until_idle().await.unwrap()
    }

    /// Same database, remote and locks over an edited source tree
    fn with_source(&self, source: MemorySource) -> Harness {
        let ctx = MirrorContext::new(
            self.ctx.config.clone(),
            self.ctx.storage.clone(),
            Arc::new(source),
            self.ctx.content.clone(),
            self.remote.clone(),
            self.ctx.locks.clone(),
        );
        Harness {
            ctx,
            remote: self.remote.clone(),
        }
    }
}

/// P1 (root) -> F1 -> file A with revisions 1.0 and 1.1
fn example_tree() -> MemorySource {
    MemorySource::new()
        .with_project(1, "P1", None)
        .with_folder(5, 1, None, "F1")
        .with_file(50, 1, Some(5), "A.txt")
        .with_revision(500, 50, 1, 0)
        .with_revision(501, 50, 1, 1)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_example_tree_then_idempotent_rerun() {
    let h = harness(example_tree(), MemoryRemote::new(), MemoryContentLocator::new());
    h.enqueue(Task::SeedTree);

    let report = h.drain().await;
    assert_eq!(report.failed, 0);
    assert_eq!(h.remote.mutation_count(), 6);
    assert_eq!(report.mutations, 6);
    assert_eq!(h.bound_rows(), 6);

    let object_id = h.lookup(EntityKind::DmsfFileRevision, 500).unwrap();
    assert_eq!(
        h.remote.path_of(&object_id),
        vec!["Redmine", "P1", "DMSF Folders", "F1", "A.txt"]
    );
    assert_eq!(h.remote.object(&object_id).unwrap().versions, vec![10000, 10001]);

    // Every task of the tree again: all resolve through the mapping
    h.remote.clear_calls();
    for task in [
        Task::SeedTree,
        Task::CreateBasedir,
        Task::CreateProjectFolder { project_id: 1 },
        Task::CreateProjectDmsfFolder { project_id: 1 },
        Task::CreateDmsfFolder { folder_id: 5 },
        Task::UploadDmsfRevision { revision_id: 500 },
        Task::UploadDmsfRevision { revision_id: 501 },
    ] {
        h.enqueue(task);
    }
    let report = h.drain().await;
    assert_eq!(h.remote.calls(), Vec::<RemoteCall>::new());
    assert_eq!(report.mutations, 0);
    assert_eq!(report.skipped, 6);
    assert_eq!(h.bound_rows(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_duplicate_tasks_create_one_object() {
    let h = harness(
        MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_folder(5, 1, None, "Specs"),
        MemoryRemote::new().with_latency(Duration::from_millis(2)),
        MemoryContentLocator::new(),
    );
    for _ in 0..8 {
        h.enqueue(Task::CreateDmsfFolder { folder_id: 5 });
    }

    // Two pools on one database behave like two worker processes
    let first = WorkerPool::new(&h.ctx);
    let second = WorkerPool::new(&h.ctx).with_concurrency(3);
    let (a, b) = tokio::join!(first.run_until_idle(), second.run_until_idle());
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.failed + b.failed, 0);

    let dmsf_root = h.lookup(EntityKind::ProjectDmsf, 1).unwrap();
    let specs = h.remote.children_named(&dmsf_root, "Specs");
    assert_eq!(specs.len(), 1);
    assert_eq!(h.lookup(EntityKind::DmsfFolder, 5), Some(specs[0].id.clone()));
    assert_eq!(h.remote.children_named(MEMORY_ROOT_ID, "Redmine").len(), 1);
    assert_eq!(h.remote.object_count(), 4);
    assert_eq!(a.mutations + b.mutations, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_children_never_created_before_parents() {
    let source = MemorySource::new()
        .with_project(1, "Root", None)
        .with_project(2, "Sub", Some(1))
        .with_project(3, "SubSub", Some(2))
        .with_folder(10, 3, None, "Outer")
        .with_folder(11, 3, Some(10), "Inner")
        .with_file(100, 3, Some(11), "deep.txt")
        .with_revision(1000, 100, 1, 0)
        .with_file(101, 2, None, "shallow.txt")
        .with_revision(1010, 101, 1, 0)
        .with_document(20, 1, "Minutes")
        .with_attachment(200, 20, "minutes.pdf");
    let h = harness(
        source,
        MemoryRemote::new().with_latency(Duration::from_millis(1)),
        MemoryContentLocator::new(),
    );
    // Leaves first, so every dependency is discovered by deferral
    for task in [
        Task::UploadDocumentAttachment { attachment_id: 200 },
        Task::UploadDmsfRevision { revision_id: 1000 },
        Task::UploadDmsfRevision { revision_id: 1010 },
    ] {
        h.enqueue(task);
    }

    let report = h.drain().await;
    assert_eq!(report.failed, 0);
    assert!(report.rescheduled > 0);

    let mut created: HashSet<String> = HashSet::from([MEMORY_ROOT_ID.to_string()]);
    for call in h.remote.calls() {
        if let RemoteCall::Create {
            parent_id,
            object_id,
            name,
        } = call
        {
            assert!(
                created.contains(&parent_id),
                "{} created under {} before its parent existed",
                name,
                parent_id
            );
            created.insert(object_id);
        }
    }

    let deep = h.lookup(EntityKind::DmsfFileRevision, 1000).unwrap();
    assert_eq!(
        h.remote.path_of(&deep),
        vec!["Redmine", "Root", "Sub", "SubSub", "DMSF Folders", "Outer", "Inner", "deep.txt"]
    );
    let attachment = h.lookup(EntityKind::DocumentAttachment, 200).unwrap();
    assert_eq!(
        h.remote.path_of(&attachment),
        vec!["Redmine", "Root", "Documents", "Minutes", "minutes.pdf"]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revisions_pushed_in_order_when_enqueued_in_reverse() {
    let h = harness(
        MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_file(10, 1, None, "plan.txt")
            .with_revision(100, 10, 1, 0)
            .with_revision(101, 10, 1, 1)
            .with_revision(102, 10, 2, 0),
        MemoryRemote::new().with_latency(Duration::from_millis(1)),
        MemoryContentLocator::new(),
    );
    for revision_id in [102, 101, 100] {
        h.enqueue(Task::UploadDmsfRevision { revision_id });
    }

    let report = h.drain().await;
    assert_eq!(report.failed, 0);

    let object_id = h.lookup(EntityKind::DmsfFileRevision, 100).unwrap();
    let object = h.remote.object(&object_id).unwrap();
    assert_eq!(object.versions, vec![10000, 10001, 20000]);
    assert_eq!(h.remote.children_named(&h.lookup(EntityKind::ProjectDmsf, 1).unwrap(), "plan.txt").len(), 1);
    assert!(h.lookup(EntityKind::DmsfFileRevision, 101).is_some());
    assert!(h.lookup(EntityKind::DmsfFileRevision, 102).is_some());
}

#[tokio::test]
async fn test_existing_remote_folder_is_reconciled() {
    let h = harness(
        MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_folder(5, 1, None, "Specs")
            .with_folder(6, 1, None, "Drafts"),
        MemoryRemote::new(),
        MemoryContentLocator::new(),
    );
    h.enqueue(Task::CreateDmsfFolder { folder_id: 6 });
    h.drain().await;

    // "Specs" appears out of band, e.g. left by an interrupted earlier run
    let dmsf_root = h.lookup(EntityKind::ProjectDmsf, 1).unwrap();
    let existing = h.remote.insert_existing(&dmsf_root, "Specs", FOLDER_MIME_TYPE);
    h.remote.clear_calls();

    h.enqueue(Task::CreateDmsfFolder { folder_id: 5 });
    let report = h.drain().await;
    assert_eq!(report.failed, 0);
    assert_eq!(h.remote.mutation_count(), 0);
    assert_eq!(h.lookup(EntityKind::DmsfFolder, 5), Some(existing));
    assert_eq!(h.remote.children_named(&dmsf_root, "Specs").len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_budget_fails_only_its_subtree() {
    let remote = MemoryRemote::new();
    remote.fail_name_transiently("Broken");
    let mut h = harness(
        MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_folder(5, 1, None, "Healthy")
            .with_folder(6, 1, None, "Broken")
            .with_file(50, 1, Some(5), "ok.txt")
            .with_revision(500, 50, 1, 0)
            .with_file(60, 1, Some(6), "stuck.txt")
            .with_revision(600, 60, 1, 0),
        remote,
        MemoryContentLocator::new(),
    );
    h.ctx.config.task_retry.max_retries = 3;
    h.enqueue(Task::SeedTree);

    let report = h.drain().await;
    assert!(report.failed >= 2);

    assert!(h.lookup(EntityKind::DmsfFileRevision, 500).is_some());
    assert!(h.lookup(EntityKind::DmsfFolder, 6).is_none());
    assert!(h.lookup(EntityKind::DmsfFileRevision, 600).is_none());

    let failed: HashSet<String> = h
        .ctx
        .queue()
        .list_failed(100)
        .unwrap()
        .into_iter()
        .map(|row| row.task_name)
        .collect();
    assert!(failed.contains("create_dmsf_folder"));
    assert!(failed.contains("upload_dmsf_revision"));

    let dmsf_root = h.lookup(EntityKind::ProjectDmsf, 1).unwrap();
    assert!(h.remote.children_named(&dmsf_root, "Broken").is_empty());
}

#[tokio::test]
async fn test_missing_content_fails_the_leaf_only() {
    let h = harness(
        MemorySource::new()
            .with_project(1, "Alpha", None)
            .with_file(10, 1, None, "here.txt")
            .with_revision(100, 10, 1, 0)
            .with_file(11, 1, None, "gone.txt")
            .with_revision(110, 11, 1, 0),
        MemoryRemote::new(),
        MemoryContentLocator::new().without("rev_110"),
    );
    h.enqueue(Task::UploadDmsfRevision { revision_id: 100 });
    h.enqueue(Task::UploadDmsfRevision { revision_id: 110 });

    let report = h.drain().await;
    assert_eq!(report.failed, 1);
    assert!(h.lookup(EntityKind::DmsfFileRevision, 100).is_some());
    assert!(h.lookup(EntityKind::DmsfFileRevision, 110).is_none());

    let failed = h.ctx.queue().list_failed(10).unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].last_error.as_deref().unwrap_or("").contains("content"));
}

#[tokio::test]
async fn test_seed_skips_mapped_leaves() {
    let h = harness(example_tree(), MemoryRemote::new(), MemoryContentLocator::new());
    h.enqueue(Task::UploadDmsfRevision { revision_id: 500 });
    h.drain().await;
    assert!(h.lookup(EntityKind::DmsfFileRevision, 500).is_some());
    assert!(h.lookup(EntityKind::DmsfFileRevision, 501).is_none());

    h.remote.clear_calls();
    h.enqueue(Task::SeedTree);
    let report = h.drain().await;
    // seed_tree itself plus the one remaining revision
    assert_eq!(report.completed, 2);
    assert_eq!(report.mutations, 1);
    assert_eq!(h.remote.mutation_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revision_folder_decides_file_placement() {
    let source = MemorySource::new()
        .with_project(1, "P1", None)
        .with_folder(5, 1, None, "FileFolder")
        .with_folder(6, 1, None, "RevisionFolder")
        .with_file(50, 1, Some(5), "A.txt")
        .with_revision(500, 50, 1, 0)
        .with_revision_folder(500, 6)
        .with_revision(501, 50, 1, 1);
    let h = harness(source, MemoryRemote::new(), MemoryContentLocator::new());
    // The later revision first: it must still land where 1.0 puts the file
    h.enqueue(Task::UploadDmsfRevision { revision_id: 501 });
    h.enqueue(Task::SeedTree);

    let report = h.drain().await;
    assert_eq!(report.failed, 0);
    let object_id = h.lookup(EntityKind::DmsfFileRevision, 500).unwrap();
    assert_eq!(
        h.remote.path_of(&object_id),
        vec!["Redmine", "P1", "DMSF Folders", "RevisionFolder", "A.txt"]
    );
    assert_eq!(h.remote.object(&object_id).unwrap().versions, vec![10000, 10001]);
    assert!(h.lookup(EntityKind::DmsfFolder, 5).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deleted_initial_revision_keeps_updating_object() {
    let h = harness(example_tree(), MemoryRemote::new(), MemoryContentLocator::new());
    h.enqueue(Task::SeedTree);
    assert_eq!(h.drain().await.failed, 0);
    let object_id = h.lookup(EntityKind::DmsfFileRevision, 500).unwrap();

    // 1.0 is deleted in the source, 2.0 is added
    let h = h.with_source(
        example_tree()
            .with_revision(502, 50, 2, 0)
            .with_deleted_revision(500),
    );
    h.remote.clear_calls();
    h.enqueue(Task::SeedTree);
    let report = h.drain().await;
    assert_eq!(report.failed, 0);
    assert_eq!(report.mutations, 1);
    assert_eq!(
        h.remote.object(&object_id).unwrap().versions,
        vec![10000, 10001, 20000]
    );
    assert!(h.lookup(EntityKind::DmsfFileRevision, 502).is_some());
    assert_eq!(h.remote.object_count(), 5);
}

//! Treemirror CLI
//!
//! One-shot batch mirroring and task queue administration.

use std::time::Duration;

use clap::{Parser, Subcommand};

use treemirror::app::{init_logging, CommonArgs};
use treemirror::error::{MirrorError, Result};
use treemirror::lock::SqliteTaskLock;
use treemirror::storage::mapping;
use treemirror::{BatchWalker, Task, TaskQueue};

#[derive(Parser)]
#[command(name = "treemirror")]
#[command(about = "Mirror a Redmine/DMSF tree into Google Drive")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk the whole tree once and mirror it (no queue, no locks)
    Batch,
    /// Enqueue a tree seeding task
    Seed,
    /// Enqueue one task
    Enqueue {
        /// Task name, e.g. create_dmsf_folder
        task: String,
        /// Source id argument
        id: Option<i64>,
    },
    /// Mapping and queue counts
    Status,
    /// List permanently failed tasks
    Failed {
        /// Maximum number to return
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
    /// Move failed tasks back to pending with a fresh retry budget
    RequeueFailed,
    /// Return abandoned running tasks to pending and drop expired locks
    Recover {
        /// Running tasks older than this many seconds are abandoned
        #[arg(long, default_value = "600")]
        older_than_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.common.log_json);

    match cli.command {
        Commands::Batch => {
            let ctx = cli.common.build_context()?;
            let report = BatchWalker::new(&ctx).run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_clean() {
                return Err(MirrorError::Internal(format!(
                    "{} entities failed",
                    report.failures.len()
                )));
            }
        }
        Commands::Seed => {
            let queue = TaskQueue::new(cli.common.open_storage()?);
            match queue.enqueue_unique(&Task::SeedTree)? {
                Some(id) => println!("Enqueued task #{}", id),
                None => println!("Seeding already queued"),
            }
        }
        Commands::Enqueue { task, id } => {
            let task = Task::from_name(&task, id)?;
            let queue = TaskQueue::new(cli.common.open_storage()?);
            match queue.enqueue_unique(&task)? {
                Some(id) => println!("Enqueued {} as task #{}", task, id),
                None => println!("{} is already pending or running", task),
            }
        }
        Commands::Status => {
            let storage = cli.common.open_storage()?;
            let mappings = storage.with_connection(mapping::mapping_stats)?;
            let queue = TaskQueue::new(storage).stats()?;
            let status = serde_json::json!({
                "mappings": mappings,
                "queue": queue,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Failed { limit } => {
            let queue = TaskQueue::new(cli.common.open_storage()?);
            let failed = queue.list_failed(limit)?;
            if failed.is_empty() {
                println!("No failed tasks");
            }
            for row in failed {
                println!(
                    "#{} {} {} (retries: {}) {}",
                    row.id,
                    row.task_name,
                    row.args,
                    row.retries,
                    row.last_error.as_deref().unwrap_or("")
                );
            }
        }
        Commands::RequeueFailed => {
            let queue = TaskQueue::new(cli.common.open_storage()?);
            println!("Requeued {} tasks", queue.requeue_failed()?);
        }
        Commands::Recover { older_than_secs } => {
            let storage = cli.common.open_storage()?;
            let recovered =
                TaskQueue::new(storage.clone()).recover_stale(Duration::from_secs(older_than_secs))?;
            let purged = SqliteTaskLock::new(storage).purge_expired()?;
            println!("Recovered {} tasks, purged {} expired locks", recovered, purged);
        }
    }

    Ok(())
}

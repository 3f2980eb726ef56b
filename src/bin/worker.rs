//! Treemirror worker
//!
//! Runs a pool of task workers against the shared queue. Start as many
//! processes as wanted against the same database.

use clap::Parser;

use treemirror::app::{init_logging, CommonArgs};
use treemirror::error::Result;
use treemirror::WorkerPool;

#[derive(Parser)]
#[command(name = "treemirror-worker")]
#[command(about = "Treemirror task worker")]
#[command(version)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Concurrent tasks in this process (overrides the config file)
    #[arg(long, env = "TREEMIRROR_WORKERS")]
    workers: Option<usize>,

    /// Exit once no task is pending or running
    #[arg(long)]
    drain: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.common.log_json);

    let ctx = args.common.build_context()?;
    let mut pool = WorkerPool::new(&ctx);
    if let Some(workers) = args.workers {
        pool = pool.with_concurrency(workers);
    }

    let report = if args.drain {
        pool.run_until_idle().await?
    } else {
        pool.run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

//! foreman indexing worker — drains the indexing-job queue and keeps the
//! semantic-search corpus in sync with the store.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use fm_core::config::IndexingConfig;
use fm_core::shutdown::ShutdownSignal;
use fm_core::store::StoreDb;
use fm_index::embedder::HashEmbedder;
use fm_index::worker::IndexWorker;

#[derive(Debug, Parser)]
#[command(name = "fm-indexd", about = "Run the foreman indexing worker")]
struct Args {
    /// Path to the SQLite database shared with the broker.
    #[arg(long)]
    db: String,

    /// Directory containing repository checkouts, one per repository id.
    #[arg(long, default_value = "repos")]
    repos_root: String,

    /// Embedding dimension the store was created with.
    #[arg(long, default_value_t = 384)]
    embedding_dim: usize,

    /// Seconds between queue polls.
    #[arg(long, default_value_t = 5)]
    poll_interval_secs: u64,

    /// Maximum jobs processed concurrently per poll.
    #[arg(long, default_value_t = 3)]
    max_parallel_jobs: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fm_telemetry::logging::init_logging("fm-indexd", "info");

    let store = Arc::new(
        StoreDb::new(&args.db, args.embedding_dim)
            .await
            .with_context(|| format!("failed to open store at {}", args.db))?,
    );

    let cfg = IndexingConfig {
        poll_interval_secs: args.poll_interval_secs,
        max_parallel_jobs: args.max_parallel_jobs,
        ..IndexingConfig::default()
    };
    let embedder = Arc::new(HashEmbedder::new(args.embedding_dim));
    let worker = IndexWorker::new(store, embedder, &args.repos_root, cfg);

    let shutdown = ShutdownSignal::new();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, stopping indexing worker");
            ctrl_c_shutdown.trigger();
        }
    });

    worker.run(shutdown).await;
    Ok(())
}

//! foreman agent worker — one process per agent id.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use fm_core::store::StoreDb;
use fm_worker::behavior::{behavior_for, EchoLlm};
use fm_worker::runner::WorkerRuntime;

#[derive(Debug, Parser)]
#[command(name = "fm-worker", about = "Run one foreman agent worker")]
struct Args {
    /// Agent id this worker executes tasks for.
    #[arg(long)]
    agent_id: String,

    /// Path to the SQLite database shared with the broker.
    #[arg(long)]
    db: String,

    /// Broker gateway WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:7850/ws")]
    broker_url: String,

    /// Embedding dimension the store was created with.
    #[arg(long, default_value_t = 384)]
    embedding_dim: usize,

    /// Bound on finishing the current task after a stop request.
    #[arg(long, default_value_t = 30)]
    stop_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    fm_telemetry::logging::init_logging("fm-worker", "info");

    let store = Arc::new(
        StoreDb::new(&args.db, args.embedding_dim)
            .await
            .with_context(|| format!("failed to open store at {}", args.db))?,
    );

    let Some(agent) = store.get_agent(&args.agent_id).await? else {
        bail!("no agent registered with id {}", args.agent_id);
    };
    if !agent.enabled {
        bail!("agent {} is disabled", agent.name);
    }

    info!(agent_id = %agent.id, name = %agent.name, kind = %agent.kind, "worker starting");
    let behavior = behavior_for(agent.kind, Arc::new(EchoLlm));
    let runtime = WorkerRuntime::new(store, agent, behavior, args.broker_url)
        .with_stop_grace(Duration::from_secs(args.stop_grace_secs));

    runtime.run().await?;
    info!("worker terminated gracefully");
    Ok(())
}

//! foreman broker daemon — serves the gateway, dispatches tasks to agent
//! workers, and broadcasts state to connected clients.

use anyhow::{Context, Result};
use tracing::info;

use fm_broker::daemon::Daemon;
use fm_core::config::Config;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    fm_telemetry::logging::init_logging("fm-broker", "info");

    // Optional config path: `fm-broker [--config path/to/foreman.toml]`.
    // Without one, `~/.foreman/foreman.toml` is consulted, then defaults.
    let mut args = std::env::args().skip(1);
    let mut config_path = None;
    while let Some(arg) = args.next() {
        if arg == "--config" || arg == "-c" {
            config_path = args.next();
        }
    }
    let config = match config_path.as_deref() {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {path}"))?,
        None => Config::load().context("failed to load config")?,
    };

    let bind_addr = format!("{}:{}", config.broker.host, config.broker.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind listener on {bind_addr}"))?;
    info!(addr = %bind_addr, db = %config.store.path, "foreman broker starting");

    let daemon = Daemon::new(config).await?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run_with_listener(listener).await
}

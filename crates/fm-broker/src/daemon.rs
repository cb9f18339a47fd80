use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use fm_bridge::event_bus::EventBus;
use fm_bridge::gateway::{self, GatewayState};
use fm_bridge::rpc::RpcRouter;
use fm_core::config::Config;
use fm_core::index_queue::IndexQueue;
use fm_core::shutdown::ShutdownSignal;
use fm_core::store::StoreDb;
use fm_core::task_queue::TaskQueue;

use crate::api::{self, ApiContext, CiRunner, LocalCiRunner};
use crate::broker::Broker;
use crate::streaming::StreamingMessages;
use crate::tracker::AgentStateTracker;

/// The main foreman broker process.
///
/// Owns the store, the event bus, dispatch, the agent-state tracker, the
/// streaming sweeper, and the RPC surface, and serves the gateway on a bound
/// listener until shutdown is triggered.
pub struct Daemon {
    config: Config,
    store: Arc<StoreDb>,
    bus: EventBus,
    ctx: Arc<ApiContext>,
    gateway_state: Arc<GatewayState>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open (or create) the store from config and wire every component.
    pub async fn new(config: Config) -> Result<Self> {
        let store = StoreDb::new(&config.store.path, config.store.embedding_dim)
            .await
            .context("failed to open store database")?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Build a daemon over an existing store (tests use an in-memory one).
    /// Must be called within a tokio runtime.
    pub fn with_store(config: Config, store: Arc<StoreDb>) -> Self {
        let bus = EventBus::new();
        let queue = TaskQueue::new(store.clone());
        let broker = Arc::new(Broker::with_dedup_window(
            store.clone(),
            queue.clone(),
            bus.clone(),
            Duration::from_secs(config.broker.dedup_window_secs),
        ));
        let tracker = AgentStateTracker::with_windows(
            store.clone(),
            queue.clone(),
            bus.clone(),
            Duration::from_millis(config.broker.state_coalesce_ms),
            Duration::from_secs(2),
        );
        let streaming = StreamingMessages::new(store.clone(), bus.clone());
        let index_queue = IndexQueue::new(store.clone());
        let ci: Arc<dyn CiRunner> = Arc::new(LocalCiRunner::default());

        let ctx = Arc::new(ApiContext {
            store: store.clone(),
            queue,
            bus: bus.clone(),
            broker,
            tracker: tracker.clone(),
            streaming: streaming.clone(),
            index_queue,
            ci,
        });

        let router = Arc::new(RpcRouter::new());
        api::register_routes(&router, ctx.clone());

        // Gateway presence feeds the tracker's service_online flags; explicit
        // worker status reports arrive over the /agents topic.
        let (presence_tx, presence_rx) = flume::unbounded();
        tracker.spawn_presence_listener(presence_rx);
        tracker.spawn_status_listener();

        let shutdown = ShutdownSignal::new();
        streaming.spawn_sweeper(
            Duration::from_secs(config.streaming.stale_after_secs),
            Duration::from_secs(config.streaming.sweep_interval_secs),
            shutdown.clone(),
        );

        let gateway_state =
            Arc::new(GatewayState::new(bus.clone(), router).with_presence(presence_tx));

        Self {
            config,
            store,
            bus,
            ctx,
            gateway_state,
            shutdown,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<StoreDb> {
        &self.store
    }

    pub fn context(&self) -> &Arc<ApiContext> {
        &self.ctx
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn gateway_state(&self) -> Arc<GatewayState> {
        self.gateway_state.clone()
    }

    /// Handle for triggering shutdown from another task (ctrl-c, RPC).
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serve the gateway until shutdown. The bus closes on the way out so
    /// late publishers fail fast with a transport error.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let state = self.gateway_state.clone();

        tokio::select! {
            result = gateway::serve(listener, state) => {
                result.context("gateway server failed")?;
            }
            _ = shutdown_rx.recv() => {
                info!("shutdown requested, stopping gateway");
            }
        }

        self.bus.close();
        info!("broker stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

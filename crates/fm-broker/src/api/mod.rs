// ---------------------------------------------------------------------------
// RPC surface
// ---------------------------------------------------------------------------
//
// Domain-oriented handler modules registered on the gateway's RpcRouter.
// This file owns the shared context handed to every handler and the mapping
// from domain errors onto wire error kinds.

mod agents;
pub mod ci;
mod tickets;

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use fm_bridge::event_bus::EventBus;
use fm_bridge::protocol::{EventEnvelope, RpcError};
use fm_bridge::rpc::RpcRouter;
use fm_core::index_queue::IndexQueue;
use fm_core::store::{StoreDb, StoreError};
use fm_core::task_queue::{TaskQueue, TaskQueueError};

use crate::broker::{Broker, BrokerError};
use crate::streaming::{StreamingError, StreamingMessages};
use crate::tracker::AgentStateTracker;

pub use ci::{CiRun, CiRunner, LocalCiRunner};

/// Shared state for all RPC handlers.
pub struct ApiContext {
    pub store: Arc<StoreDb>,
    pub queue: TaskQueue,
    pub bus: EventBus,
    pub broker: Arc<Broker>,
    pub tracker: AgentStateTracker,
    pub streaming: StreamingMessages,
    pub index_queue: IndexQueue,
    pub ci: Arc<dyn CiRunner>,
}

impl ApiContext {
    /// Publish a domain event envelope; a dropped publish is counted by the
    /// bus and never propagates into the request path.
    pub fn publish_event(&self, topic: &str, event: &str, data: Value) {
        let envelope = EventEnvelope::new(event, data);
        if let Err(e) = self.bus.publish(topic, envelope.to_value()) {
            warn!(topic = %topic, event = %event, error = %e, "event publish dropped");
        }
    }
}

/// Register every handler module on the router.
pub fn register_routes(router: &RpcRouter, ctx: Arc<ApiContext>) {
    tickets::register(router, ctx.clone());
    agents::register(router, ctx.clone());
    ci::register(router, ctx);
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

pub(crate) fn store_err(e: StoreError) -> RpcError {
    RpcError::internal(e.to_string())
}

pub(crate) fn queue_err(e: TaskQueueError) -> RpcError {
    match e {
        TaskQueueError::NotFound(id) => RpcError::not_found(format!("task {id}")),
        TaskQueueError::Conflict { .. } => RpcError::conflict(e.to_string()),
        TaskQueueError::Store(inner) => store_err(inner),
    }
}

pub(crate) fn broker_err(e: BrokerError) -> RpcError {
    match e {
        BrokerError::AgentNotFound(id) => RpcError::not_found(format!("agent {id}")),
        BrokerError::AgentDisabled(id) => RpcError::conflict(format!("agent {id} is disabled")),
        BrokerError::Queue(inner) => queue_err(inner),
        BrokerError::Store(inner) => store_err(inner),
    }
}

pub(crate) fn streaming_err(e: StreamingError) -> RpcError {
    match e {
        StreamingError::NotFound(id) => RpcError::not_found(format!("comment {id}")),
        StreamingError::Store(inner) => store_err(inner),
    }
}

/// Parse a typed request body, reporting malformed fields as `Validation`.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(data: Value) -> Result<T, RpcError> {
    serde_json::from_value(data).map_err(|e| RpcError::validation(format!("invalid body: {e}")))
}

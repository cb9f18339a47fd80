use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use fm_bridge::protocol::{events, topics, Method, RpcError};
use fm_bridge::rpc::{RpcRequest, RpcRouter};
use fm_core::types::new_id;

use super::{parse_body, ApiContext};

// ---------------------------------------------------------------------------
// CiRunner — typed interface over the external runner
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiRun {
    pub id: String,
    pub ticket_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

/// The external CI orchestrator as the core sees it. The real runner shells
/// out to build infrastructure; the core only starts runs and lists them.
#[async_trait]
pub trait CiRunner: Send + Sync {
    async fn start_run(&self, ticket_id: &str) -> Result<CiRun, String>;
    async fn runs_for(&self, ticket_id: &str) -> Vec<CiRun>;
}

/// In-memory run recorder; stands in when no external runner is wired.
#[derive(Default)]
pub struct LocalCiRunner {
    runs: Mutex<HashMap<String, Vec<CiRun>>>,
}

#[async_trait]
impl CiRunner for LocalCiRunner {
    async fn start_run(&self, ticket_id: &str) -> Result<CiRun, String> {
        let run = CiRun {
            id: new_id(),
            ticket_id: ticket_id.to_string(),
            status: "queued".to_string(),
            started_at: Utc::now(),
        };
        let mut runs = self.runs.lock().await;
        runs.entry(ticket_id.to_string()).or_default().push(run.clone());
        Ok(run)
    }

    async fn runs_for(&self, ticket_id: &str) -> Vec<CiRun> {
        let runs = self.runs.lock().await;
        runs.get(ticket_id).cloned().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub(crate) fn register(router: &RpcRouter, ctx: Arc<ApiContext>) {
    let c = ctx.clone();
    router.register(Method::Get, "/api/ci/runs/:ticketId", move |req| {
        let ctx = c.clone();
        async move { list_runs(ctx, req).await }
    });

    let c = ctx;
    router.register(Method::Post, "/api/ci/run", move |req| {
        let ctx = c.clone();
        async move { start_run(ctx, req).await }
    });
}

async fn list_runs(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let ticket_id = req.param("ticketId").unwrap_or_default();
    let runs = ctx.ci.runs_for(ticket_id).await;
    Ok(json!(runs))
}

#[derive(Debug, Deserialize)]
struct StartRunBody {
    ticket_id: String,
}

async fn start_run(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let body: StartRunBody = parse_body(req.data)?;
    let run = ctx
        .ci
        .start_run(&body.ticket_id)
        .await
        .map_err(RpcError::upstream)?;
    ctx.publish_event(
        topics::CI,
        events::CI_RUN_STARTED,
        serde_json::to_value(&run).unwrap_or(Value::Null),
    );
    serde_json::to_value(&run).map_err(|e| RpcError::internal(e.to_string()))
}

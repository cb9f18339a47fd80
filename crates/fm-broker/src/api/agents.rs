use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use fm_bridge::protocol::{events, topics, Method, RpcError};
use fm_bridge::rpc::{RpcRequest, RpcRouter};
use fm_core::types::{AgentKind, AgentRecord};

use super::{parse_body, store_err, ApiContext};

pub(crate) fn register(router: &RpcRouter, ctx: Arc<ApiContext>) {
    let c = ctx.clone();
    router.register(Method::Get, "/api/agents", move |req| {
        let ctx = c.clone();
        async move { list_agents(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Post, "/api/agents", move |req| {
        let ctx = c.clone();
        async move { create_agent(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Put, "/api/agents/:id", move |req| {
        let ctx = c.clone();
        async move { update_agent(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Delete, "/api/agents/:id", move |req| {
        let ctx = c.clone();
        async move { delete_agent(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Post, "/api/agents/:id/trigger", move |req| {
        let ctx = c.clone();
        async move { trigger_agent(ctx, req).await }
    });

    let c = ctx;
    router.register(Method::Post, "/api/agents/:id/subscribe", move |req| {
        let ctx = c.clone();
        async move { bind_subscription(ctx, req).await }
    });
}

async fn agent_view(ctx: &ApiContext, agent: &AgentRecord) -> Value {
    let state = ctx.tracker.projected(&agent.id).await;
    let mut view = serde_json::to_value(agent).unwrap_or(Value::Null);
    view["state"] = serde_json::to_value(&state).unwrap_or(Value::Null);
    view
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// List agents enriched with their live shadow status.
async fn list_agents(ctx: Arc<ApiContext>, _req: RpcRequest) -> Result<Value, RpcError> {
    let agents = ctx.store.list_agents().await.map_err(store_err)?;
    let mut views = Vec::with_capacity(agents.len());
    for agent in &agents {
        views.push(agent_view(&ctx, agent).await);
    }
    Ok(json!(views))
}

#[derive(Debug, Deserialize)]
struct CreateAgentBody {
    name: String,
    kind: AgentKind,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    config: Option<Value>,
    #[serde(default)]
    description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

async fn create_agent(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let body: CreateAgentBody = parse_body(req.data)?;
    if body.name.trim().is_empty() {
        return Err(RpcError::validation("name must not be empty"));
    }
    if ctx
        .store
        .get_agent_by_name(&body.name)
        .await
        .map_err(store_err)?
        .is_some()
    {
        return Err(RpcError::conflict(format!(
            "agent name already taken: {}",
            body.name
        )));
    }

    let mut agent = AgentRecord::new(body.name, body.kind);
    agent.enabled = body.enabled;
    agent.config = body.config;
    agent.description = body.description;
    ctx.store.insert_agent(&agent).await.map_err(store_err)?;

    let view = agent_view(&ctx, &agent).await;
    ctx.publish_event(topics::AGENTS, events::AGENT_CREATED, view.clone());
    Ok(view)
}

#[derive(Debug, Deserialize)]
struct UpdateAgentBody {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    kind: Option<AgentKind>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    config: Option<Option<Value>>,
    #[serde(default)]
    description: Option<Option<String>>,
}

async fn update_agent(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let id = req.param("id").unwrap_or_default().to_string();
    let body: UpdateAgentBody = parse_body(req.data)?;

    let mut agent = ctx
        .store
        .get_agent(&id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("agent {id}")))?;

    if let Some(name) = body.name {
        if name.trim().is_empty() {
            return Err(RpcError::validation("name must not be empty"));
        }
        if let Some(existing) = ctx
            .store
            .get_agent_by_name(&name)
            .await
            .map_err(store_err)?
        {
            if existing.id != agent.id {
                return Err(RpcError::conflict(format!("agent name already taken: {name}")));
            }
        }
        agent.name = name;
    }
    if let Some(kind) = body.kind {
        agent.kind = kind;
    }
    if let Some(enabled) = body.enabled {
        agent.enabled = enabled;
    }
    if let Some(config) = body.config {
        agent.config = config;
    }
    if let Some(description) = body.description {
        agent.description = description;
    }

    ctx.store.update_agent(&agent).await.map_err(store_err)?;
    let view = agent_view(&ctx, &agent).await;
    ctx.publish_event(topics::AGENTS, events::AGENT_UPDATED, view.clone());
    Ok(view)
}

async fn delete_agent(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    req.require_actor()?;
    let id = req.param("id").unwrap_or_default();
    if !ctx.store.delete_agent(id).await.map_err(store_err)? {
        return Err(RpcError::not_found(format!("agent {id}")));
    }
    ctx.publish_event(topics::AGENTS, events::AGENT_DELETED, json!({"id": id}));
    Ok(json!({"deleted": id}))
}

#[derive(Debug, Deserialize, Default)]
struct TriggerBody {
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    priority: Option<i64>,
}

/// Enqueue a manual task for an agent.
async fn trigger_agent(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let id = req.param("id").unwrap_or_default().to_string();
    let body: TriggerBody = if req.data.is_null() {
        TriggerBody::default()
    } else {
        parse_body(req.data)?
    };

    let task = ctx
        .broker
        .trigger_manual(&id, body.payload.unwrap_or(json!({})), body.priority)
        .await
        .map_err(super::broker_err)?;
    ctx.tracker.notify_tasks_changed();
    serde_json::to_value(&task).map_err(|e| RpcError::internal(e.to_string()))
}

/// Worker-initiated binding after connect: marks the agent online and tells
/// the worker how much catch-up work is waiting.
async fn bind_subscription(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let id = req.param("id").unwrap_or_default().to_string();
    let agent = ctx
        .store
        .get_agent(&id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("agent {id}")))?;

    ctx.tracker.set_service_online(&agent.id, true);
    let pending = ctx
        .queue
        .list_pending(&agent.id)
        .await
        .map_err(super::queue_err)?;
    Ok(json!({
        "subscribed": true,
        "agent_id": agent.id,
        "pending": pending.len(),
    }))
}

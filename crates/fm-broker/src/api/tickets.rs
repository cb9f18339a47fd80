use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use fm_bridge::protocol::{events, topics, Method, RpcError};
use fm_bridge::rpc::{RpcRequest, RpcRouter};
use fm_core::mentions;
use fm_core::types::{ActorKind, ActorRef, Comment, Ticket, TicketStatus};

use super::{parse_body, store_err, streaming_err, ApiContext};

pub(crate) fn register(router: &RpcRouter, ctx: Arc<ApiContext>) {
    let c = ctx.clone();
    router.register(Method::Post, "/api/tickets", move |req| {
        let ctx = c.clone();
        async move { create_ticket(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Get, "/api/tickets", move |req| {
        let ctx = c.clone();
        async move { list_tickets(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Get, "/api/tickets/:id", move |req| {
        let ctx = c.clone();
        async move { get_ticket(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Put, "/api/tickets/:id", move |req| {
        let ctx = c.clone();
        async move { update_ticket(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Delete, "/api/tickets/:id", move |req| {
        let ctx = c.clone();
        async move { delete_ticket(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Post, "/api/tickets/:id/approve", move |req| {
        let ctx = c.clone();
        async move { approve_ticket(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Post, "/api/tickets/:id/reopen", move |req| {
        let ctx = c.clone();
        async move { reopen_ticket(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(Method::Post, "/api/tickets/:id/comments", move |req| {
        let ctx = c.clone();
        async move { create_comment(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(
        Method::Put,
        "/api/tickets/:id/comments/:commentId",
        move |req| {
            let ctx = c.clone();
            async move { update_comment(ctx, req).await }
        },
    );

    let c = ctx.clone();
    router.register(
        Method::Post,
        "/api/tickets/:id/comments/:commentId/broadcast",
        move |req| {
            let ctx = c.clone();
            async move { broadcast_comment(ctx, req).await }
        },
    );

    let c = ctx.clone();
    router.register(Method::Post, "/api/tickets/:id/streaming", move |req| {
        let ctx = c.clone();
        async move { create_streaming(ctx, req).await }
    });

    let c = ctx.clone();
    router.register(
        Method::Put,
        "/api/tickets/:id/streaming/:commentId",
        move |req| {
            let ctx = c.clone();
            async move { update_streaming(ctx, req).await }
        },
    );

    let c = ctx;
    router.register(
        Method::Post,
        "/api/tickets/:id/streaming/:commentId/finalize",
        move |req| {
            let ctx = c.clone();
            async move { finalize_streaming(ctx, req).await }
        },
    );
}

// ---------------------------------------------------------------------------
// Ticket CRUD
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateTicketBody {
    repository_id: String,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    solution_plan: Option<String>,
    #[serde(default)]
    status: Option<TicketStatus>,
    #[serde(default)]
    priority: Option<i64>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    assignees: Vec<ActorRef>,
}

fn validate_priority(priority: Option<i64>) -> Result<(), RpcError> {
    if let Some(p) = priority {
        if !(0..=10).contains(&p) {
            return Err(RpcError::validation(format!(
                "priority must be in 0..=10, got {p}"
            )));
        }
    }
    Ok(())
}

async fn ticket_view(ctx: &ApiContext, ticket: &Ticket) -> Result<Value, RpcError> {
    let labels = ctx.store.ticket_labels(&ticket.id).await.map_err(store_err)?;
    let assignees = ctx
        .store
        .ticket_assignees(&ticket.id)
        .await
        .map_err(store_err)?;
    let mut view = serde_json::to_value(ticket)
        .map_err(|e| RpcError::internal(e.to_string()))?;
    view["labels"] = json!(labels);
    view["assignees"] = json!(assignees);
    Ok(view)
}

async fn create_ticket(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let body: CreateTicketBody = parse_body(req.data)?;
    if body.title.trim().is_empty() {
        return Err(RpcError::validation("title must not be empty"));
    }
    if body.repository_id.trim().is_empty() {
        return Err(RpcError::validation("repository_id must not be empty"));
    }
    validate_priority(body.priority)?;

    let mut ticket = Ticket::new(
        body.repository_id,
        body.title,
        body.status.unwrap_or(TicketStatus::Backlog),
    );
    ticket.description = body.description;
    ticket.solution_plan = body.solution_plan;
    ticket.priority = body.priority;

    ctx.store.insert_ticket(&ticket).await.map_err(store_err)?;
    if !body.labels.is_empty() {
        ctx.store
            .set_ticket_labels(&ticket.id, body.labels)
            .await
            .map_err(store_err)?;
    }
    if !body.assignees.is_empty() {
        ctx.store
            .set_ticket_assignees(&ticket.id, body.assignees)
            .await
            .map_err(store_err)?;
    }

    let view = ticket_view(&ctx, &ticket).await?;
    ctx.publish_event(topics::TICKETS, events::TICKET_CREATED, view.clone());
    ctx.index_queue.queue_ticket(&ticket.id).await;

    // Backlog tickets spawn a refinement task; a missing planner only logs.
    ctx.broker
        .on_ticket_created(&ticket)
        .await
        .map_err(super::broker_err)?;
    ctx.tracker.notify_tasks_changed();

    Ok(view)
}

async fn list_tickets(ctx: Arc<ApiContext>, _req: RpcRequest) -> Result<Value, RpcError> {
    let tickets = ctx.store.list_tickets().await.map_err(store_err)?;
    Ok(json!(tickets))
}

async fn get_ticket(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let id = req.param("id").unwrap_or_default();
    let ticket = ctx
        .store
        .get_ticket(id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("ticket {id}")))?;
    let mut view = ticket_view(&ctx, &ticket).await?;
    let comments = ctx.store.list_comments(id).await.map_err(store_err)?;
    view["comments"] = json!(comments);
    Ok(view)
}

#[derive(Debug, Deserialize)]
struct UpdateTicketBody {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<Option<String>>,
    #[serde(default)]
    solution_plan: Option<Option<String>>,
    #[serde(default)]
    status: Option<TicketStatus>,
    #[serde(default)]
    priority: Option<Option<i64>>,
    #[serde(default)]
    labels: Option<Vec<String>>,
    #[serde(default)]
    assignees: Option<Vec<ActorRef>>,
}

async fn update_ticket(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let id = req.param("id").unwrap_or_default().to_string();
    let body: UpdateTicketBody = parse_body(req.data)?;

    let mut ticket = ctx
        .store
        .get_ticket(&id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("ticket {id}")))?;

    if let Some(title) = body.title {
        if title.trim().is_empty() {
            return Err(RpcError::validation("title must not be empty"));
        }
        ticket.title = title;
    }
    if let Some(description) = body.description {
        ticket.description = description;
    }
    if let Some(solution_plan) = body.solution_plan {
        ticket.solution_plan = solution_plan;
    }
    if let Some(status) = body.status {
        ticket.status = status;
    }
    if let Some(priority) = body.priority {
        validate_priority(priority)?;
        ticket.priority = priority;
    }

    ctx.store.update_ticket(&ticket).await.map_err(store_err)?;
    if let Some(labels) = body.labels {
        ctx.store
            .set_ticket_labels(&id, labels)
            .await
            .map_err(store_err)?;
    }
    if let Some(assignees) = body.assignees {
        let prior = ctx
            .store
            .ticket_assignees(&id)
            .await
            .map_err(store_err)?;
        ctx.store
            .set_ticket_assignees(&id, assignees.clone())
            .await
            .map_err(store_err)?;

        // Newly assigned agents get an assignment task.
        let mut dispatched = false;
        for assignee in &assignees {
            if assignee.kind == ActorKind::Agent && !prior.contains(assignee) {
                ctx.broker
                    .on_ticket_assigned(&ticket, &assignee.id)
                    .await
                    .map_err(super::broker_err)?;
                dispatched = true;
            }
        }
        if dispatched {
            ctx.tracker.notify_tasks_changed();
        }
    }

    let view = ticket_view(&ctx, &ticket).await?;
    ctx.publish_event(topics::TICKETS, events::TICKET_UPDATED, view.clone());
    ctx.index_queue.queue_ticket(&id).await;
    Ok(view)
}

async fn delete_ticket(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    req.require_actor()?;
    let id = req.param("id").unwrap_or_default();
    if !ctx.store.delete_ticket(id).await.map_err(store_err)? {
        return Err(RpcError::not_found(format!("ticket {id}")));
    }
    ctx.publish_event(topics::TICKETS, events::TICKET_DELETED, json!({"id": id}));
    Ok(json!({"deleted": id}))
}

// ---------------------------------------------------------------------------
// Status transitions
// ---------------------------------------------------------------------------

async fn approve_ticket(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    req.require_actor()?;
    let id = req.param("id").unwrap_or_default();
    let ticket = ctx
        .store
        .get_ticket(id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("ticket {id}")))?;

    if ticket.status != TicketStatus::Review {
        return Err(RpcError::conflict(format!(
            "cannot approve ticket in status {}",
            ticket.status
        )));
    }

    ctx.store
        .set_ticket_status(id, TicketStatus::Closed)
        .await
        .map_err(store_err)?;
    ctx.publish_event(
        topics::TICKETS,
        events::TICKET_APPROVED,
        json!({"id": id, "status": TicketStatus::Closed}),
    );
    Ok(json!({"id": id, "status": TicketStatus::Closed}))
}

async fn reopen_ticket(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    req.require_actor()?;
    let id = req.param("id").unwrap_or_default();
    let ticket = ctx
        .store
        .get_ticket(id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("ticket {id}")))?;

    if ticket.status != TicketStatus::Closed {
        return Err(RpcError::conflict(format!(
            "cannot reopen ticket in status {}",
            ticket.status
        )));
    }

    ctx.store
        .set_ticket_status(id, TicketStatus::Todo)
        .await
        .map_err(store_err)?;
    ctx.publish_event(
        topics::TICKETS,
        events::TICKET_UPDATED,
        json!({"id": id, "status": TicketStatus::Todo}),
    );
    Ok(json!({"id": id, "status": TicketStatus::Todo}))
}

// ---------------------------------------------------------------------------
// Comments
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateCommentBody {
    author_type: ActorKind,
    author_id: String,
    content: String,
    #[serde(default)]
    responding_to: Option<String>,
}

async fn create_comment(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let ticket_id = req.param("id").unwrap_or_default().to_string();
    let body: CreateCommentBody = parse_body(req.data)?;
    if body.content.trim().is_empty() {
        return Err(RpcError::validation("content must not be empty"));
    }
    if ctx
        .store
        .get_ticket(&ticket_id)
        .await
        .map_err(store_err)?
        .is_none()
    {
        return Err(RpcError::not_found(format!("ticket {ticket_id}")));
    }

    let mut comment = Comment::new(
        &ticket_id,
        ActorRef {
            kind: body.author_type,
            id: body.author_id,
        },
        body.content,
    );
    comment.responding_to = body.responding_to;

    // Mentions are parsed on creation only; comment edits never re-dispatch.
    let names = mentions::parse_mentions(&comment.content);
    if !names.is_empty() {
        comment.mentions = Some(names);
    }

    let stored = ctx.store.insert_comment(&comment).await.map_err(store_err)?;
    ctx.publish_event(
        topics::TICKETS,
        events::COMMENT_CREATED,
        serde_json::to_value(&stored).map_err(|e| RpcError::internal(e.to_string()))?,
    );

    let tasks = ctx
        .broker
        .on_comment_created(&stored)
        .await
        .map_err(super::broker_err)?;
    if !tasks.is_empty() {
        ctx.tracker.notify_tasks_changed();
    }

    let mut view = serde_json::to_value(&stored).map_err(|e| RpcError::internal(e.to_string()))?;
    view["dispatched_tasks"] = json!(tasks.iter().map(|t| t.id.clone()).collect::<Vec<_>>());
    Ok(view)
}

#[derive(Debug, Deserialize)]
struct UpdateCommentBody {
    content: String,
}

async fn update_comment(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let comment_id = req.param("commentId").unwrap_or_default().to_string();
    let body: UpdateCommentBody = parse_body(req.data)?;

    if !ctx
        .store
        .update_comment_content(&comment_id, &body.content)
        .await
        .map_err(store_err)?
    {
        return Err(RpcError::not_found(format!("comment {comment_id}")));
    }
    let comment = ctx
        .store
        .get_comment(&comment_id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| RpcError::not_found(format!("comment {comment_id}")))?;

    ctx.publish_event(
        topics::TICKETS,
        events::COMMENT_UPDATED,
        serde_json::to_value(&comment).map_err(|e| RpcError::internal(e.to_string()))?,
    );
    serde_json::to_value(&comment).map_err(|e| RpcError::internal(e.to_string()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BroadcastKind {
    Created,
    Updated,
    Completed,
}

#[derive(Debug, Deserialize)]
struct BroadcastBody {
    #[serde(rename = "type")]
    kind: BroadcastKind,
}

// ---------------------------------------------------------------------------
// Streaming messages
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct CreateStreamingBody {
    author_id: String,
    #[serde(default)]
    initial_content: String,
    #[serde(default)]
    responding_to: Option<String>,
}

/// Open a generating comment placeholder on a ticket.
async fn create_streaming(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let ticket_id = req.param("id").unwrap_or_default().to_string();
    let body: CreateStreamingBody = parse_body(req.data)?;
    if ctx
        .store
        .get_ticket(&ticket_id)
        .await
        .map_err(store_err)?
        .is_none()
    {
        return Err(RpcError::not_found(format!("ticket {ticket_id}")));
    }

    let comment = ctx
        .streaming
        .create(
            &ticket_id,
            ActorRef::agent(body.author_id),
            &body.initial_content,
            body.responding_to,
        )
        .await
        .map_err(streaming_err)?;
    serde_json::to_value(&comment).map_err(|e| RpcError::internal(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct StreamingContentBody {
    #[serde(default)]
    content: Option<String>,
}

async fn update_streaming(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let comment_id = req.param("commentId").unwrap_or_default().to_string();
    let body: StreamingContentBody = parse_body(req.data)?;
    let content = body
        .content
        .ok_or_else(|| RpcError::validation("content is required"))?;
    let comment = ctx
        .streaming
        .update(&comment_id, &content)
        .await
        .map_err(streaming_err)?;
    serde_json::to_value(&comment).map_err(|e| RpcError::internal(e.to_string()))
}

async fn finalize_streaming(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let comment_id = req.param("commentId").unwrap_or_default().to_string();
    let body: StreamingContentBody = if req.data.is_null() {
        StreamingContentBody { content: None }
    } else {
        parse_body(req.data)?
    };
    let comment = ctx
        .streaming
        .finalize(&comment_id, body.content.as_deref())
        .await
        .map_err(streaming_err)?;
    serde_json::to_value(&comment).map_err(|e| RpcError::internal(e.to_string()))
}

/// Remote workers write comment rows through the shared store, then ask the
/// broker to publish the matching event on their behalf.
async fn broadcast_comment(ctx: Arc<ApiContext>, req: RpcRequest) -> Result<Value, RpcError> {
    let comment_id = req.param("commentId").unwrap_or_default().to_string();
    let body: BroadcastBody = parse_body(req.data)?;
    let event = match body.kind {
        BroadcastKind::Created => events::COMMENT_CREATED,
        BroadcastKind::Updated => events::COMMENT_UPDATED,
        BroadcastKind::Completed => events::COMMENT_COMPLETED,
    };
    let comment = ctx
        .streaming
        .rebroadcast(&comment_id, event)
        .await
        .map_err(streaming_err)?;
    Ok(json!({"broadcast": event, "comment_id": comment.id}))
}

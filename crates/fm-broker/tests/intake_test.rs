use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use fm_broker::daemon::Daemon;
use fm_bridge::protocol::{topics, Method};
use fm_core::config::Config;
use fm_core::store::StoreDb;
use fm_core::types::{AgentKind, AgentRecord, TaskStatus, TicketStatus};

async fn daemon() -> Daemon {
    let store = Arc::new(StoreDb::new_in_memory(4).await.unwrap());
    Daemon::with_store(Config::default(), store)
}

async fn seed_agent(daemon: &Daemon, id: &str, name: &str, kind: AgentKind) -> AgentRecord {
    let mut agent = AgentRecord::new(name, kind);
    agent.id = id.to_string();
    daemon.store().insert_agent(&agent).await.unwrap();
    agent
}

async fn rpc(
    daemon: &Daemon,
    method: Method,
    path: &str,
    data: Value,
    actor: Option<&str>,
) -> Result<Value, fm_bridge::protocol::RpcError> {
    daemon
        .gateway_state()
        .router
        .dispatch(
            method,
            path,
            HashMap::new(),
            data,
            actor.map(String::from),
            None,
        )
        .await
}

fn envelope(payload: Value) -> (String, Value) {
    let event = payload["event"].as_str().unwrap_or_default().to_string();
    (event, payload["data"].clone())
}

// ---------------------------------------------------------------------------
// Backlog refinement dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn backlog_ticket_creates_refinement_task_for_planner() {
    let daemon = daemon().await;
    seed_agent(&daemon, "a1", "Planner", AgentKind::Planner).await;

    let tickets_sub = daemon.event_bus().subscribe(topics::TICKETS);
    let push_sub = daemon.event_bus().subscribe(topics::agent_tasks("a1"));

    let view = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "x", "status": "backlog"}),
        None,
    )
    .await
    .unwrap();

    let ticket_id = view["id"].as_str().unwrap().to_string();
    let stored = daemon.store().get_ticket(&ticket_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TicketStatus::Backlog);

    let (event, data) = envelope(tickets_sub.try_recv().expect("ticket event"));
    assert_eq!(event, "ticket:created");
    assert_eq!(data["id"], ticket_id);

    // Exactly one refinement task, priority 50, pending, pushed once.
    let pending = daemon.context().queue.list_pending("a1").await.unwrap();
    assert_eq!(pending.len(), 1);
    let task = &pending[0];
    assert_eq!(task.task_type, fm_core::types::TaskType::Refinement);
    assert_eq!(task.priority, 50);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.payload["ticket_id"], ticket_id);

    let push = push_sub.try_recv().expect("one push");
    assert_eq!(push["task_id"], task.id);
    assert!(push_sub.try_recv().is_none());
}

#[tokio::test]
async fn ticket_without_planner_still_succeeds() {
    let daemon = daemon().await;
    let view = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "orphan", "status": "backlog"}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(view["status"], "backlog");
}

#[tokio::test]
async fn ticket_validation_rejects_bad_input() {
    let daemon = daemon().await;
    let err = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "   "}),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, fm_bridge::protocol::RpcErrorKind::Validation);

    let err = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "x", "priority": 99}),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, fm_bridge::protocol::RpcErrorKind::Validation);
}

// ---------------------------------------------------------------------------
// Mention dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn comment_mention_dispatches_task_to_named_agent() {
    let daemon = daemon().await;
    let dev = seed_agent(&daemon, "dev-1", "Dev", AgentKind::Developer).await;

    let view = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "t1", "status": "todo"}),
        None,
    )
    .await
    .unwrap();
    let ticket_id = view["id"].as_str().unwrap().to_string();

    let tickets_sub = daemon.event_bus().subscribe(topics::TICKETS);
    let push_sub = daemon.event_bus().subscribe(topics::agent_tasks(&dev.id));

    let comment = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/comments"),
        json!({"author_type": "human", "author_id": "u1", "content": "hey @Dev please look"}),
        None,
    )
    .await
    .unwrap();

    let comment_id = comment["id"].as_str().unwrap().to_string();
    assert_eq!(comment["mentions"], json!(["Dev"]));

    let (event, data) = envelope(tickets_sub.try_recv().expect("comment event"));
    assert_eq!(event, "comment:created");
    assert_eq!(data["id"], comment_id);

    let pending = daemon.context().queue.list_pending(&dev.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    let task = &pending[0];
    assert_eq!(task.task_type, fm_core::types::TaskType::Mention);
    assert_eq!(task.priority, 100);
    assert_eq!(task.payload["comment_id"], comment_id);
    assert_eq!(task.payload["ticket_id"], ticket_id);
    assert_eq!(task.payload["comment_content"], "hey @Dev please look");
    assert_eq!(task.payload["mentions"], json!(["Dev"]));

    let push = push_sub.try_recv().expect("one push");
    assert_eq!(push["task_id"], task.id);
    assert!(push_sub.try_recv().is_none());
}

#[tokio::test]
async fn comment_without_mentions_dispatches_nothing() {
    let daemon = daemon().await;
    seed_agent(&daemon, "dev-1", "Dev", AgentKind::Developer).await;

    let view = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "t", "status": "todo"}),
        None,
    )
    .await
    .unwrap();
    let ticket_id = view["id"].as_str().unwrap();

    let comment = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/comments"),
        json!({"author_type": "human", "author_id": "u1", "content": "no names here"}),
        None,
    )
    .await
    .unwrap();
    assert!(comment["mentions"].is_null());
    assert!(daemon.context().queue.list_pending("dev-1").await.unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Approve / reopen transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn approve_requires_review_status_and_actor() {
    let daemon = daemon().await;
    let view = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "t", "status": "review"}),
        None,
    )
    .await
    .unwrap();
    let ticket_id = view["id"].as_str().unwrap().to_string();

    // No actor: unauthorized.
    let err = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/approve"),
        Value::Null,
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, fm_bridge::protocol::RpcErrorKind::Unauthorized);

    let out = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/approve"),
        Value::Null,
        Some("u1"),
    )
    .await
    .unwrap();
    assert_eq!(out["status"], "closed");

    // Approving again conflicts: the ticket left review.
    let err = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/approve"),
        Value::Null,
        Some("u1"),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, fm_bridge::protocol::RpcErrorKind::Conflict);

    // Reopen moves closed back to todo.
    let out = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/reopen"),
        Value::Null,
        Some("u1"),
    )
    .await
    .unwrap();
    assert_eq!(out["status"], "todo");

    let err = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/reopen"),
        Value::Null,
        Some("u1"),
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, fm_bridge::protocol::RpcErrorKind::Conflict);
}

// ---------------------------------------------------------------------------
// Agents surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn agent_crud_emits_events_and_enriches_state() {
    let daemon = daemon().await;
    let agents_sub = daemon.event_bus().subscribe(topics::AGENTS);

    let created = rpc(
        &daemon,
        Method::Post,
        "/api/agents",
        json!({"name": "Dev", "kind": "developer"}),
        None,
    )
    .await
    .unwrap();
    let agent_id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["state"]["activity"], "offline");

    let (event, _) = envelope(agents_sub.try_recv().unwrap());
    assert_eq!(event, "agent:created");

    // Duplicate name (case-insensitive) conflicts.
    let err = rpc(
        &daemon,
        Method::Post,
        "/api/agents",
        json!({"name": "dev", "kind": "reviewer"}),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, fm_bridge::protocol::RpcErrorKind::Conflict);

    let listed = rpc(&daemon, Method::Get, "/api/agents", Value::Null, None)
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let updated = rpc(
        &daemon,
        Method::Put,
        &format!("/api/agents/{agent_id}"),
        json!({"enabled": false}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(updated["enabled"], false);

    rpc(
        &daemon,
        Method::Delete,
        &format!("/api/agents/{agent_id}"),
        Value::Null,
        Some("u1"),
    )
    .await
    .unwrap();
    assert!(daemon.store().get_agent(&agent_id).await.unwrap().is_none());
}

#[tokio::test]
async fn trigger_enqueues_manual_task_with_default_priority() {
    let daemon = daemon().await;
    seed_agent(&daemon, "a1", "Dev", AgentKind::Developer).await;

    let task = rpc(
        &daemon,
        Method::Post,
        "/api/agents/a1/trigger",
        json!({"payload": {"prompt": "go"}}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(task["task_type"], "manual");
    assert_eq!(task["priority"], 0);
    assert_eq!(task["status"], "pending");
}

#[tokio::test]
async fn subscribe_binding_reports_pending_backlog() {
    let daemon = daemon().await;
    seed_agent(&daemon, "a1", "Dev", AgentKind::Developer).await;
    daemon
        .context()
        .queue
        .enqueue("a1", fm_core::types::TaskType::Manual, json!({}), 0)
        .await
        .unwrap();

    let out = rpc(
        &daemon,
        Method::Post,
        "/api/agents/a1/subscribe",
        Value::Null,
        None,
    )
    .await
    .unwrap();
    assert_eq!(out["subscribed"], true);
    assert_eq!(out["pending"], 1);
    assert!(daemon.context().tracker.get("a1").unwrap().service_online);
}

// ---------------------------------------------------------------------------
// Worker broadcast endpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn broadcast_endpoint_republishes_comment_events() {
    let daemon = daemon().await;
    let view = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "t", "status": "todo"}),
        None,
    )
    .await
    .unwrap();
    let ticket_id = view["id"].as_str().unwrap().to_string();

    let comment = daemon
        .context()
        .streaming
        .create(
            &ticket_id,
            fm_core::types::ActorRef::agent("a1"),
            "partial",
            None,
        )
        .await
        .unwrap();

    let sub = daemon.event_bus().subscribe(topics::TICKETS);
    let out = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/comments/{}/broadcast", comment.id),
        json!({"type": "updated"}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(out["broadcast"], "comment:updated");

    let (event, data) = envelope(sub.try_recv().expect("republished event"));
    assert_eq!(event, "comment:updated");
    assert_eq!(data["id"], comment.id);

    let err = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/comments/missing/broadcast"),
        json!({"type": "completed"}),
        None,
    )
    .await
    .unwrap_err();
    assert_eq!(err.kind, fm_bridge::protocol::RpcErrorKind::NotFound);
}

// ---------------------------------------------------------------------------
// CI wrapper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ci_run_round_trip() {
    let daemon = daemon().await;
    let ci_sub = daemon.event_bus().subscribe(topics::CI);

    let run = rpc(
        &daemon,
        Method::Post,
        "/api/ci/run",
        json!({"ticket_id": "t1"}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(run["ticket_id"], "t1");
    assert!(ci_sub.try_recv().is_some());

    let runs = rpc(&daemon, Method::Get, "/api/ci/runs/t1", Value::Null, None)
        .await
        .unwrap();
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Streaming message endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_lifecycle_over_rpc() {
    let daemon = daemon().await;
    let view = rpc(
        &daemon,
        Method::Post,
        "/api/tickets",
        json!({"repository_id": "r1", "title": "t", "status": "todo"}),
        None,
    )
    .await
    .unwrap();
    let ticket_id = view["id"].as_str().unwrap().to_string();

    let sub = daemon.event_bus().subscribe(topics::TICKETS);

    let created = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/streaming"),
        json!({"author_id": "a1", "initial_content": "thinking..."}),
        None,
    )
    .await
    .unwrap();
    let comment_id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["status"], "generating");
    let (event, _) = envelope(sub.try_recv().unwrap());
    assert_eq!(event, "comment:created");

    let updated = rpc(
        &daemon,
        Method::Put,
        &format!("/api/tickets/{ticket_id}/streaming/{comment_id}"),
        json!({"content": "partial"}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(updated["content"], "partial");
    let (event, _) = envelope(sub.try_recv().unwrap());
    assert_eq!(event, "comment:updated");

    let done = rpc(
        &daemon,
        Method::Post,
        &format!("/api/tickets/{ticket_id}/streaming/{comment_id}/finalize"),
        json!({"content": "final"}),
        None,
    )
    .await
    .unwrap();
    assert_eq!(done["status"], "completed");
    assert_eq!(done["content"], "final");
    let (event, data) = envelope(sub.try_recv().unwrap());
    assert_eq!(event, "comment:completed");
    assert_eq!(data["content"], "final");
}

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use fm_bridge::protocol::Method;
use fm_core::store::StoreDb;
use fm_core::types::{ActorRef, AgentKind, AgentRecord, Comment, CommentStatus, TaskType};

use crate::connection::BrokerClient;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BehaviorError {
    #[error("payload does not match {task_type} schema: {message}")]
    Payload {
        task_type: TaskType,
        message: String,
    },
    #[error("store error: {0}")]
    Store(#[from] fm_core::store::StoreError),
}

// ---------------------------------------------------------------------------
// Task context and payload schemas
// ---------------------------------------------------------------------------

/// Everything a behavior sees for one claimed task. The payload stays an
/// untyped value at the broker boundary; each task type parses its own
/// schema here, inside the worker.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: String,
    pub task_type: TaskType,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MentionPayload {
    pub ticket_id: String,
    pub comment_id: String,
    pub author: ActorRef,
    pub comment_content: String,
    #[serde(default)]
    pub mentions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefinementPayload {
    pub ticket_id: String,
    pub repository_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignmentPayload {
    pub ticket_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManualPayload {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub ticket_id: Option<String>,
}

impl TaskContext {
    fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, BehaviorError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| BehaviorError::Payload {
            task_type: self.task_type,
            message: e.to_string(),
        })
    }

    pub fn mention(&self) -> Result<MentionPayload, BehaviorError> {
        self.parse()
    }

    pub fn refinement(&self) -> Result<RefinementPayload, BehaviorError> {
        self.parse()
    }

    pub fn assignment(&self) -> Result<AssignmentPayload, BehaviorError> {
        self.parse()
    }

    pub fn manual(&self) -> Result<ManualPayload, BehaviorError> {
        if self.payload.is_null() {
            return Ok(ManualPayload::default());
        }
        self.parse()
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub success: bool,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            success: true,
            summary: Some(summary.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            summary: None,
            error: Some(error.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker tools — store access and streaming comments
// ---------------------------------------------------------------------------

/// Capabilities handed to a behavior alongside the task context.
#[derive(Clone)]
pub struct WorkerTools {
    pub store: Arc<StoreDb>,
    pub agent: AgentRecord,
    /// Present when the broker is remote; used to ask it to broadcast
    /// comment events on the worker's behalf.
    pub client: Option<Arc<BrokerClient>>,
}

impl WorkerTools {
    pub fn local(store: Arc<StoreDb>, agent: AgentRecord) -> Self {
        Self {
            store,
            agent,
            client: None,
        }
    }

    pub fn connected(store: Arc<StoreDb>, agent: AgentRecord, client: Arc<BrokerClient>) -> Self {
        Self {
            store,
            agent,
            client: Some(client),
        }
    }

    /// Open a streaming comment on a ticket: the row is born generating and
    /// the broker broadcasts `comment:created` on our behalf.
    pub async fn open_comment_stream(
        &self,
        ticket_id: &str,
        responding_to: Option<String>,
    ) -> Result<CommentStream, BehaviorError> {
        let mut comment = Comment::new(ticket_id, ActorRef::agent(&self.agent.id), "");
        comment.status = CommentStatus::Generating;
        comment.responding_to = responding_to;
        let stored = self.store.insert_comment(&comment).await?;
        let stream = CommentStream {
            store: self.store.clone(),
            client: self.client.clone(),
            ticket_id: ticket_id.to_string(),
            comment_id: stored.id.clone(),
        };
        stream.request_broadcast("created").await;
        Ok(stream)
    }
}

/// An in-progress streamed comment.
pub struct CommentStream {
    store: Arc<StoreDb>,
    client: Option<Arc<BrokerClient>>,
    ticket_id: String,
    comment_id: String,
}

impl CommentStream {
    pub fn comment_id(&self) -> &str {
        &self.comment_id
    }

    /// Replace the provisional content and broadcast the delta.
    pub async fn update(&self, content: &str) -> Result<(), BehaviorError> {
        self.store
            .update_comment_content(&self.comment_id, content)
            .await?;
        self.request_broadcast("updated").await;
        Ok(())
    }

    /// Finalize with the definitive content; the row flips to completed.
    pub async fn finalize(&self, content: &str) -> Result<(), BehaviorError> {
        self.store
            .finish_comment(&self.comment_id, Some(content), CommentStatus::Completed)
            .await?;
        self.request_broadcast("completed").await;
        Ok(())
    }

    async fn request_broadcast(&self, kind: &str) {
        let Some(client) = &self.client else {
            return;
        };
        let path = format!(
            "/api/tickets/{}/comments/{}/broadcast",
            self.ticket_id, self.comment_id
        );
        if let Err(e) = client
            .rpc(Method::Post, &path, json!({"type": kind}), Duration::from_secs(10))
            .await
        {
            debug!(comment_id = %self.comment_id, kind = %kind, error = %e, "broadcast request failed");
        }
    }
}

// ---------------------------------------------------------------------------
// LlmClient — external provider as a typed interface
// ---------------------------------------------------------------------------

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String>;
}

/// Deterministic stand-in used by tests and offline runs.
pub struct EchoLlm;

#[async_trait]
impl LlmClient for EchoLlm {
    async fn complete(&self, system: &str, prompt: &str) -> anyhow::Result<String> {
        let head = prompt.lines().next().unwrap_or("");
        Ok(format!("[{}] {}", system, head))
    }
}

// ---------------------------------------------------------------------------
// AgentBehavior
// ---------------------------------------------------------------------------

/// One agent role's task-processing logic. Behaviors must tolerate replay:
/// a task may be delivered more than once across reconnects, so side effects
/// are expressed as idempotent row replacements and appends.
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    async fn process(&self, ctx: &TaskContext, tools: &WorkerTools)
        -> anyhow::Result<TaskOutcome>;
}

/// Pick the built-in behavior for an agent kind.
pub fn behavior_for(kind: AgentKind, llm: Arc<dyn LlmClient>) -> Arc<dyn AgentBehavior> {
    match kind {
        AgentKind::Planner => Arc::new(PlannerBehavior { llm }),
        AgentKind::Developer => Arc::new(DeveloperBehavior { llm }),
        AgentKind::Reviewer => Arc::new(ReviewerBehavior { llm }),
    }
}

// ---------------------------------------------------------------------------
// Built-in behaviors
// ---------------------------------------------------------------------------

/// Elaborates backlog tickets: writes a solution plan and posts it as a
/// streamed comment.
pub struct PlannerBehavior {
    pub llm: Arc<dyn LlmClient>,
}

#[async_trait]
impl AgentBehavior for PlannerBehavior {
    async fn process(
        &self,
        ctx: &TaskContext,
        tools: &WorkerTools,
    ) -> anyhow::Result<TaskOutcome> {
        match ctx.task_type {
            TaskType::Refinement => {
                let payload = ctx.refinement()?;
                let prompt = format!(
                    "Ticket: {}\n{}",
                    payload.title,
                    payload.description.as_deref().unwrap_or("")
                );
                let plan = self.llm.complete("plan this ticket", &prompt).await?;

                let Some(mut ticket) = tools.store.get_ticket(&payload.ticket_id).await? else {
                    return Ok(TaskOutcome::failed(format!(
                        "ticket {} vanished before refinement",
                        payload.ticket_id
                    )));
                };
                ticket.solution_plan = Some(plan.clone());
                tools.store.update_ticket(&ticket).await?;

                let stream = tools.open_comment_stream(&payload.ticket_id, None).await?;
                stream.update("drafting a plan...").await?;
                stream.finalize(&plan).await?;
                Ok(TaskOutcome::ok(format!(
                    "refined ticket {}",
                    payload.ticket_id
                )))
            }
            _ => respond_to_conversation(ctx, tools, &*self.llm, "planner").await,
        }
    }
}

/// Answers mentions and manual prompts with a streamed reply.
pub struct DeveloperBehavior {
    pub llm: Arc<dyn LlmClient>,
}

#[async_trait]
impl AgentBehavior for DeveloperBehavior {
    async fn process(
        &self,
        ctx: &TaskContext,
        tools: &WorkerTools,
    ) -> anyhow::Result<TaskOutcome> {
        respond_to_conversation(ctx, tools, &*self.llm, "developer").await
    }
}

/// Reviews work it is pointed at and reports findings as a comment.
pub struct ReviewerBehavior {
    pub llm: Arc<dyn LlmClient>,
}

#[async_trait]
impl AgentBehavior for ReviewerBehavior {
    async fn process(
        &self,
        ctx: &TaskContext,
        tools: &WorkerTools,
    ) -> anyhow::Result<TaskOutcome> {
        respond_to_conversation(ctx, tools, &*self.llm, "reviewer").await
    }
}

/// Shared mention/manual handling: stream an LLM reply onto the ticket.
async fn respond_to_conversation(
    ctx: &TaskContext,
    tools: &WorkerTools,
    llm: &dyn LlmClient,
    role: &str,
) -> anyhow::Result<TaskOutcome> {
    let (ticket_id, prompt, responding_to) = match ctx.task_type {
        TaskType::Mention => {
            let payload = ctx.mention()?;
            (
                payload.ticket_id,
                payload.comment_content,
                Some(payload.comment_id),
            )
        }
        TaskType::Assignment => {
            let payload = ctx.assignment()?;
            (payload.ticket_id, String::from("you were assigned"), None)
        }
        TaskType::Manual => {
            let payload = ctx.manual()?;
            let Some(ticket_id) = payload.ticket_id else {
                // Nothing to respond onto; a bare manual trigger is a no-op
                // success so operators can probe liveness.
                return Ok(TaskOutcome::ok("manual trigger acknowledged"));
            };
            (
                ticket_id,
                payload.prompt.unwrap_or_else(|| "manual trigger".into()),
                None,
            )
        }
        TaskType::Refinement => {
            return Ok(TaskOutcome::failed(format!(
                "{role} cannot process refinement tasks"
            )));
        }
    };

    let reply = llm.complete(role, &prompt).await?;
    let stream = tools.open_comment_stream(&ticket_id, responding_to).await?;
    stream.finalize(&reply).await?;
    Ok(TaskOutcome::ok(format!("replied on ticket {ticket_id}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use fm_core::types::{Task, Ticket, TicketStatus};

    fn ctx_for(task: &Task) -> TaskContext {
        TaskContext {
            task_id: task.id.clone(),
            task_type: task.task_type,
            payload: task.payload.clone(),
        }
    }

    async fn tools_with_ticket() -> (WorkerTools, Ticket) {
        let store = Arc::new(StoreDb::new_in_memory(4).await.unwrap());
        let agent = AgentRecord::new("Dev", AgentKind::Developer);
        store.insert_agent(&agent).await.unwrap();
        let mut ticket = Ticket::new("r1", "Fix login", TicketStatus::Backlog);
        ticket.description = Some("expires early".into());
        store.insert_ticket(&ticket).await.unwrap();
        (WorkerTools::local(store, agent), ticket)
    }

    #[tokio::test]
    async fn mention_payload_schema_round_trip() {
        let payload = json!({
            "ticket_id": "t1",
            "comment_id": "c1",
            "author": {"kind": "human", "id": "u1"},
            "comment_content": "hey @Dev",
            "mentions": ["Dev"],
        });
        let ctx = TaskContext {
            task_id: "task".into(),
            task_type: TaskType::Mention,
            payload,
        };
        let parsed = ctx.mention().unwrap();
        assert_eq!(parsed.ticket_id, "t1");
        assert_eq!(parsed.mentions, vec!["Dev"]);

        // A mention payload does not satisfy the refinement schema.
        assert!(ctx.refinement().is_err());
    }

    #[tokio::test]
    async fn planner_refinement_writes_plan_and_comment() {
        let (tools, ticket) = tools_with_ticket().await;
        let behavior = PlannerBehavior { llm: Arc::new(EchoLlm) };
        let task = Task::new(
            &tools.agent.id,
            TaskType::Refinement,
            json!({
                "ticket_id": ticket.id,
                "repository_id": "r1",
                "title": ticket.title,
                "description": ticket.description,
            }),
            50,
        );

        let outcome = behavior.process(&ctx_for(&task), &tools).await.unwrap();
        assert!(outcome.success);

        let updated = tools.store.get_ticket(&ticket.id).await.unwrap().unwrap();
        assert!(updated.solution_plan.is_some());

        let comments = tools.store.list_comments(&ticket.id).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].status, CommentStatus::Completed);
        assert_eq!(
            comments[0].content,
            updated.solution_plan.as_deref().unwrap()
        );
    }

    #[tokio::test]
    async fn developer_mention_streams_a_reply() {
        let (tools, ticket) = tools_with_ticket().await;
        let behavior = DeveloperBehavior { llm: Arc::new(EchoLlm) };
        let task = Task::new(
            &tools.agent.id,
            TaskType::Mention,
            json!({
                "ticket_id": ticket.id,
                "comment_id": "c1",
                "author": {"kind": "human", "id": "u1"},
                "comment_content": "hey @Dev please look",
                "mentions": ["Dev"],
            }),
            100,
        );

        let outcome = behavior.process(&ctx_for(&task), &tools).await.unwrap();
        assert!(outcome.success);

        let comments = tools.store.list_comments(&ticket.id).await.unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0].status, CommentStatus::Completed);
        assert_eq!(comments[0].responding_to.as_deref(), Some("c1"));
        assert!(comments[0].content.contains("hey @Dev please look"));
    }

    #[tokio::test]
    async fn bare_manual_trigger_is_acknowledged() {
        let (tools, _ticket) = tools_with_ticket().await;
        let behavior = DeveloperBehavior { llm: Arc::new(EchoLlm) };
        let task = Task::new(&tools.agent.id, TaskType::Manual, Value::Null, 0);
        let outcome = behavior.process(&ctx_for(&task), &tools).await.unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn malformed_payload_surfaces_as_error() {
        let (tools, _ticket) = tools_with_ticket().await;
        let behavior = DeveloperBehavior { llm: Arc::new(EchoLlm) };
        let task = Task::new(
            &tools.agent.id,
            TaskType::Mention,
            json!({"nope": true}),
            100,
        );
        assert!(behavior.process(&ctx_for(&task), &tools).await.is_err());
    }
}

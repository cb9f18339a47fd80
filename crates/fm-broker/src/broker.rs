use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, info, warn};

use fm_bridge::event_bus::EventBus;
use fm_bridge::protocol::{topics, TaskPush};
use fm_core::mentions;
use fm_core::store::{StoreDb, StoreError};
use fm_core::task_queue::{TaskQueue, TaskQueueError};
use fm_core::types::{AgentKind, Comment, Task, TaskType, Ticket, TicketStatus};

/// Priority assigned to refinement tasks created for backlog tickets.
pub const REFINEMENT_PRIORITY: i64 = 50;
/// Priority assigned to mention tasks.
pub const MENTION_PRIORITY: i64 = 100;
/// Default priority for explicit manual triggers.
pub const DEFAULT_MANUAL_PRIORITY: i64 = 0;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("agent is disabled: {0}")]
    AgentDisabled(String),
    #[error(transparent)]
    Queue(#[from] TaskQueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, BrokerError>;

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

type DedupKey = (String, TaskType, String);

/// Converts domain events into tasks and routes them to workers.
///
/// Dispatch policy:
///
/// | trigger                      | target                 | type       | priority |
/// |------------------------------|------------------------|------------|----------|
/// | new ticket, status=backlog   | enabled planner agent  | refinement | 50       |
/// | `@name` in a new comment     | resolved enabled agent | mention    | 100      |
/// | explicit API trigger         | caller-specified agent | manual     | caller's |
///
/// The same (agent, type, source) event is dispatched at most once within the
/// dedup window; workers additionally defend with the claim CAS.
pub struct Broker {
    store: Arc<StoreDb>,
    queue: TaskQueue,
    bus: EventBus,
    dedup: Mutex<HashMap<DedupKey, Instant>>,
    dedup_window: Duration,
}

impl Broker {
    pub fn new(store: Arc<StoreDb>, queue: TaskQueue, bus: EventBus) -> Self {
        Self::with_dedup_window(store, queue, bus, Duration::from_secs(10))
    }

    pub fn with_dedup_window(
        store: Arc<StoreDb>,
        queue: TaskQueue,
        bus: EventBus,
        dedup_window: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            dedup: Mutex::new(HashMap::new()),
            dedup_window,
        }
    }

    /// Ticket created. Backlog tickets produce a refinement task on the
    /// enabled planner; a missing planner is logged, never an error, so
    /// ticket creation cannot fail on dispatch.
    pub async fn on_ticket_created(&self, ticket: &Ticket) -> Result<Option<Task>> {
        if ticket.status != TicketStatus::Backlog {
            return Ok(None);
        }

        let Some(planner) = self
            .store
            .first_enabled_agent_of_kind(AgentKind::Planner)
            .await?
        else {
            warn!(ticket_id = %ticket.id, "no enabled planner agent, skipping refinement dispatch");
            return Ok(None);
        };

        if self.is_duplicate(&planner.id, TaskType::Refinement, &ticket.id) {
            info!(ticket_id = %ticket.id, agent_id = %planner.id, "duplicate refinement dispatch skipped");
            return Ok(None);
        }

        let payload = json!({
            "ticket_id": ticket.id,
            "repository_id": ticket.repository_id,
            "title": ticket.title,
            "description": ticket.description,
        });
        let task = self
            .queue
            .enqueue(&planner.id, TaskType::Refinement, payload, REFINEMENT_PRIORITY)
            .await?;
        self.push(&task);
        Ok(Some(task))
    }

    /// Comment created. Each resolved, enabled mentioned agent gets one
    /// mention task carrying the full comment context.
    pub async fn on_comment_created(&self, comment: &Comment) -> Result<Vec<Task>> {
        let Some(names) = comment.mentions.as_ref().filter(|m| !m.is_empty()) else {
            return Ok(Vec::new());
        };

        let agents = mentions::resolve_mentions(&self.store, names).await?;
        let mut dispatched = Vec::new();
        for agent in agents {
            if self.is_duplicate(&agent.id, TaskType::Mention, &comment.id) {
                info!(
                    comment_id = %comment.id,
                    agent_id = %agent.id,
                    "duplicate mention dispatch skipped"
                );
                continue;
            }
            let payload = json!({
                "ticket_id": comment.ticket_id,
                "comment_id": comment.id,
                "author": comment.author,
                "comment_content": comment.content,
                "mentions": names,
            });
            let task = self
                .queue
                .enqueue(&agent.id, TaskType::Mention, payload, MENTION_PRIORITY)
                .await?;
            self.push(&task);
            dispatched.push(task);
        }
        Ok(dispatched)
    }

    /// An agent was added to a ticket's assignee set. Dispatches one
    /// assignment task per newly assigned, enabled agent.
    pub async fn on_ticket_assigned(
        &self,
        ticket: &Ticket,
        agent_id: &str,
    ) -> Result<Option<Task>> {
        let Some(agent) = self.store.get_agent(agent_id).await? else {
            warn!(ticket_id = %ticket.id, agent_id = %agent_id, "assignee is not a registered agent");
            return Ok(None);
        };
        if !agent.enabled {
            warn!(ticket_id = %ticket.id, agent_id = %agent_id, "assigned agent is disabled, skipping dispatch");
            return Ok(None);
        }
        if self.is_duplicate(&agent.id, TaskType::Assignment, &ticket.id) {
            info!(ticket_id = %ticket.id, agent_id = %agent.id, "duplicate assignment dispatch skipped");
            return Ok(None);
        }

        let payload = json!({
            "ticket_id": ticket.id,
            "repository_id": ticket.repository_id,
            "title": ticket.title,
        });
        let task = self
            .queue
            .enqueue(&agent.id, TaskType::Assignment, payload, REFINEMENT_PRIORITY)
            .await?;
        self.push(&task);
        Ok(Some(task))
    }

    /// Explicit trigger from the RPC surface. The target agent must exist and
    /// be enabled.
    pub async fn trigger_manual(
        &self,
        agent_id: &str,
        payload: serde_json::Value,
        priority: Option<i64>,
    ) -> Result<Task> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| BrokerError::AgentNotFound(agent_id.to_string()))?;
        if !agent.enabled {
            return Err(BrokerError::AgentDisabled(agent_id.to_string()));
        }

        let task = self
            .queue
            .enqueue(
                &agent.id,
                TaskType::Manual,
                payload,
                priority.unwrap_or(DEFAULT_MANUAL_PRIORITY),
            )
            .await?;
        self.push(&task);
        Ok(task)
    }

    /// Publish the task push on the agent's channel. When no worker is
    /// subscribed the task stays pending and is delivered via catch-up on the
    /// next subscription; a closed bus is logged and never fails dispatch.
    fn push(&self, task: &Task) {
        let push = TaskPush {
            task_id: task.id.clone(),
            task_type: task.task_type,
            task_data: task.payload.clone(),
        };
        let topic = topics::agent_tasks(&task.agent_id);
        match serde_json::to_value(&push) {
            Ok(payload) => {
                if let Err(e) = self.bus.publish(&topic, payload) {
                    warn!(task_id = %task.id, topic = %topic, error = %e, "task push not delivered");
                } else {
                    debug!(task_id = %task.id, topic = %topic, "task push published");
                }
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "task push serialization failed"),
        }
    }

    /// Sliding-window duplicate check on (agent, type, source).
    fn is_duplicate(&self, agent_id: &str, task_type: TaskType, source_id: &str) -> bool {
        let mut dedup = self.dedup.lock().expect("dedup lock poisoned");
        let now = Instant::now();
        dedup.retain(|_, seen| now.duration_since(*seen) < self.dedup_window);
        let key = (agent_id.to_string(), task_type, source_id.to_string());
        if dedup.contains_key(&key) {
            return true;
        }
        dedup.insert(key, now);
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

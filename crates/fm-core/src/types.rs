use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Generate a fresh opaque entity id.
///
/// Ids are opaque strings at every boundary; UUID v4 is only the generation
/// strategy, never something callers may rely on.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// TicketStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Backlog,
    Todo,
    InProgress,
    Review,
    Closed,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TicketStatus::Backlog => "backlog",
            TicketStatus::Todo => "todo",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Review => "review",
            TicketStatus::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Ticket
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub repository_id: String,
    pub title: String,
    pub description: Option<String>,
    pub solution_plan: Option<String>,
    pub status: TicketStatus,
    /// Optional priority in 0..=10.
    pub priority: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn new(
        repository_id: impl Into<String>,
        title: impl Into<String>,
        status: TicketStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            repository_id: repository_id.into(),
            title: title.into(),
            description: None,
            solution_plan: None,
            status,
            priority: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Text indexed for semantic search: title and description joined by a
    /// blank line.
    pub fn embedding_text(&self) -> String {
        format!(
            "{}\n\n{}",
            self.title,
            self.description.as_deref().unwrap_or("")
        )
    }
}

// ---------------------------------------------------------------------------
// Actors (comment authors, assignees)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Agent,
    Human,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRef {
    pub kind: ActorKind,
    pub id: String,
}

impl ActorRef {
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Human,
            id: id.into(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Agent,
            id: id.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Comment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommentStatus {
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub ticket_id: String,
    pub author: ActorRef,
    pub content: String,
    /// Agent names referenced with `@name`, when any resolved at creation.
    pub mentions: Option<Vec<String>>,
    pub status: CommentStatus,
    pub responding_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    pub fn new(ticket_id: impl Into<String>, author: ActorRef, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            ticket_id: ticket_id.into(),
            author,
            content: content.into(),
            mentions: None,
            status: CommentStatus::Completed,
            responding_to: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Planner,
    Developer,
    Reviewer,
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentKind::Planner => "planner",
            AgentKind::Developer => "developer",
            AgentKind::Reviewer => "reviewer",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    /// Unique case-insensitively; mention resolution ignores case.
    pub name: String,
    pub kind: AgentKind,
    pub enabled: bool,
    /// Opaque behavior configuration; the core never inspects it.
    pub config: Option<serde_json::Value>,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn new(name: impl Into<String>, kind: AgentKind) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            kind,
            enabled: true,
            config: None,
            description: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Mention,
    Assignment,
    Manual,
    Refinement,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskType::Mention => "mention",
            TaskType::Assignment => "assignment",
            TaskType::Manual => "manual",
            TaskType::Refinement => "refinement",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal states are sticky: no transition ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub agent_id: String,
    pub task_type: TaskType,
    /// Opaque JSON; each task type carries its own schema, parsed inside the
    /// worker, never at the broker boundary.
    pub payload: serde_json::Value,
    /// Higher first; ties broken by age (oldest first).
    pub priority: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    pub fn new(
        agent_id: impl Into<String>,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: i64,
    ) -> Self {
        Self {
            id: new_id(),
            agent_id: agent_id.into(),
            task_type,
            payload,
            priority,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskStats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

// ---------------------------------------------------------------------------
// Agent shadow state (broker-side projection, never persisted)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentActivity {
    Idle,
    Working,
    Error,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentShadowState {
    pub service_online: bool,
    pub activity: AgentActivity,
    pub message: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub stats: TaskStats,
}

impl Default for AgentShadowState {
    fn default() -> Self {
        Self {
            service_online: false,
            activity: AgentActivity::Offline,
            message: None,
            last_heartbeat: None,
            last_activity: None,
            stats: TaskStats::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Label
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub color: String,
}

// ---------------------------------------------------------------------------
// Document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            title: title.into(),
            content: content.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Indexing jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexJobKind {
    Code,
    Doc,
    Ticket,
}

impl fmt::Display for IndexJobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IndexJobKind::Code => "code",
            IndexJobKind::Doc => "doc",
            IndexJobKind::Ticket => "ticket",
        };
        write!(f, "{}", label)
    }
}

/// A queued indexing job. Exactly one target reference is populated,
/// matching the kind: (repository_id, file_path) for code, doc_id for doc,
/// ticket_id for ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJob {
    pub id: String,
    pub kind: IndexJobKind,
    pub repository_id: Option<String>,
    pub file_path: Option<String>,
    pub doc_id: Option<String>,
    pub ticket_id: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl IndexJob {
    fn blank(kind: IndexJobKind) -> Self {
        Self {
            id: new_id(),
            kind,
            repository_id: None,
            file_path: None,
            doc_id: None,
            ticket_id: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn code(repository_id: impl Into<String>, file_path: impl Into<String>) -> Self {
        let mut job = Self::blank(IndexJobKind::Code);
        job.repository_id = Some(repository_id.into());
        job.file_path = Some(file_path.into());
        job
    }

    pub fn doc(doc_id: impl Into<String>) -> Self {
        let mut job = Self::blank(IndexJobKind::Doc);
        job.doc_id = Some(doc_id.into());
        job
    }

    pub fn ticket(ticket_id: impl Into<String>) -> Self {
        let mut job = Self::blank(IndexJobKind::Ticket);
        job.ticket_id = Some(ticket_id.into());
        job
    }

    /// Human-readable target for logs.
    pub fn target(&self) -> String {
        match self.kind {
            IndexJobKind::Code => format!(
                "{}:{}",
                self.repository_id.as_deref().unwrap_or("?"),
                self.file_path.as_deref().unwrap_or("?")
            ),
            IndexJobKind::Doc => self.doc_id.clone().unwrap_or_else(|| "?".into()),
            IndexJobKind::Ticket => self.ticket_id.clone().unwrap_or_else(|| "?".into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Embedding rows
// ---------------------------------------------------------------------------

/// Content kinds stored in the vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Code,
    Doc,
    Ticket,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContentKind::Code => "code",
            ContentKind::Doc => "doc",
            ContentKind::Ticket => "ticket",
        };
        write!(f, "{}", label)
    }
}

/// One embedded chunk of a ticket, document, or code unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRow {
    pub chunk_index: i64,
    pub chunk_text: String,
    pub metadata: Option<serde_json::Value>,
    pub vector: Vec<f32>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn ticket_embedding_text_handles_missing_description() {
        let t = Ticket::new("r1", "Fix login", TicketStatus::Backlog);
        assert_eq!(t.embedding_text(), "Fix login\n\n");

        let mut t2 = t.clone();
        t2.description = Some("Session expires too early".into());
        assert_eq!(t2.embedding_text(), "Fix login\n\nSession expires too early");
    }

    #[test]
    fn index_job_targets() {
        assert_eq!(IndexJob::code("r1", "/a.ts").target(), "r1:/a.ts");
        assert_eq!(IndexJob::doc("d1").target(), "d1");
        assert_eq!(IndexJob::ticket("t1").target(), "t1");
    }

    #[test]
    fn status_enums_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&TicketStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&TaskType::Refinement).unwrap(),
            "\"refinement\""
        );
        assert_eq!(
            serde_json::to_string(&AgentActivity::Working).unwrap(),
            "\"working\""
        );
    }

    #[test]
    fn shadow_state_defaults_offline() {
        let s = AgentShadowState::default();
        assert!(!s.service_online);
        assert_eq!(s.activity, AgentActivity::Offline);
        assert_eq!(s.stats, TaskStats::default());
    }
}

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tokio_rusqlite::Connection;

use crate::types::{
    ActorKind, ActorRef, AgentKind, AgentRecord, Comment, CommentStatus, ContentKind, Document,
    EmbeddingRow, IndexJob, IndexJobKind, Label, Task, TaskStats, TaskStatus, TaskType, Ticket,
    TicketStatus,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a compare-and-swap claim on a specific task.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// The task transitioned pending -> processing and is ours.
    Claimed(Task),
    /// The task exists but is not pending; carries the observed status.
    Conflict(TaskStatus),
    /// No such task.
    NotFound,
}

// ---------------------------------------------------------------------------
// helpers — enum <-> SQLite string
// ---------------------------------------------------------------------------

fn enum_to_sql<T: serde::Serialize>(val: &T) -> String {
    let s = serde_json::to_string(val).expect("serialize enum");
    s.trim_matches('"').to_string()
}

fn enum_from_sql<T: serde::de::DeserializeOwned>(raw: &str) -> T {
    let quoted = format!("\"{}\"", raw);
    serde_json::from_str(&quoted).expect("deserialize enum")
}

fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn ts_from_sql(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .expect("valid date")
        .with_timezone(&Utc)
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn vector_from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

// ---------------------------------------------------------------------------
// StoreDb
// ---------------------------------------------------------------------------

/// Async SQLite-backed store shared by the broker, the agent workers, and the
/// indexing worker. WAL mode plus a busy timeout make it safe for multiple
/// same-host processes; every multi-step update runs inside one connection
/// call (a single statement or an explicit transaction).
pub struct StoreDb {
    conn: Connection,
    embedding_dim: usize,
}

impl StoreDb {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>, embedding_dim: usize) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await.map_err(StoreError::Db)?;
        let db = Self {
            conn,
            embedding_dim,
        };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory(embedding_dim: usize) -> Result<Self> {
        let conn = Connection::open_in_memory().await.map_err(StoreError::Db)?;
        let db = Self {
            conn,
            embedding_dim,
        };
        db.init_schema().await?;
        Ok(db)
    }

    /// The configured embedding dimension. Tables are created to match it and
    /// are never altered in place.
    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS tickets (
                        id            TEXT PRIMARY KEY,
                        repository_id TEXT NOT NULL,
                        title         TEXT NOT NULL,
                        description   TEXT,
                        solution_plan TEXT,
                        status        TEXT NOT NULL,
                        priority      INTEGER,
                        created_at    TEXT NOT NULL,
                        updated_at    TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_tickets_status ON tickets(status);
                    CREATE INDEX IF NOT EXISTS idx_tickets_repo   ON tickets(repository_id);

                    CREATE TABLE IF NOT EXISTS label_defs (
                        name  TEXT PRIMARY KEY,
                        color TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS ticket_labels (
                        ticket_id  TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                        label_name TEXT NOT NULL REFERENCES label_defs(name) ON DELETE CASCADE,
                        PRIMARY KEY (ticket_id, label_name)
                    );

                    CREATE TABLE IF NOT EXISTS ticket_assignees (
                        ticket_id     TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                        assignee_kind TEXT NOT NULL,
                        assignee_id   TEXT NOT NULL,
                        PRIMARY KEY (ticket_id, assignee_kind, assignee_id)
                    );

                    CREATE TABLE IF NOT EXISTS comments (
                        id            TEXT PRIMARY KEY,
                        ticket_id     TEXT NOT NULL REFERENCES tickets(id) ON DELETE CASCADE,
                        author_kind   TEXT NOT NULL,
                        author_id     TEXT NOT NULL,
                        content       TEXT NOT NULL,
                        mentions      TEXT,
                        status        TEXT NOT NULL,
                        responding_to TEXT,
                        created_at    TEXT NOT NULL,
                        updated_at    TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_comments_ticket ON comments(ticket_id, created_at);
                    CREATE INDEX IF NOT EXISTS idx_comments_status ON comments(status);

                    CREATE TABLE IF NOT EXISTS agents (
                        id          TEXT PRIMARY KEY,
                        name        TEXT NOT NULL UNIQUE COLLATE NOCASE,
                        kind        TEXT NOT NULL,
                        enabled     INTEGER NOT NULL DEFAULT 1,
                        config      TEXT,
                        description TEXT,
                        created_at  TEXT NOT NULL,
                        updated_at  TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS agent_tasks (
                        id           TEXT PRIMARY KEY,
                        agent_id     TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
                        task_type    TEXT NOT NULL,
                        payload      TEXT NOT NULL,
                        priority     INTEGER NOT NULL DEFAULT 0,
                        status       TEXT NOT NULL,
                        created_at   TEXT NOT NULL,
                        started_at   TEXT,
                        completed_at TEXT,
                        error        TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_tasks_agent_status
                        ON agent_tasks(agent_id, status, priority DESC, created_at ASC);

                    CREATE TABLE IF NOT EXISTS documents (
                        id         TEXT PRIMARY KEY,
                        title      TEXT NOT NULL,
                        content    TEXT NOT NULL,
                        created_at TEXT NOT NULL,
                        updated_at TEXT NOT NULL
                    );

                    CREATE TABLE IF NOT EXISTS doc_labels (
                        doc_id     TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                        label_name TEXT NOT NULL REFERENCES label_defs(name) ON DELETE CASCADE,
                        PRIMARY KEY (doc_id, label_name)
                    );

                    CREATE TABLE IF NOT EXISTS index_jobs (
                        id            TEXT PRIMARY KEY,
                        kind          TEXT NOT NULL,
                        repository_id TEXT,
                        file_path     TEXT,
                        doc_id        TEXT,
                        ticket_id     TEXT,
                        status        TEXT NOT NULL,
                        created_at    TEXT NOT NULL,
                        started_at    TEXT,
                        completed_at  TEXT,
                        error         TEXT
                    );

                    CREATE INDEX IF NOT EXISTS idx_index_jobs_status
                        ON index_jobs(status, created_at ASC);

                    CREATE TABLE IF NOT EXISTS code_file_hashes (
                        repository_id TEXT NOT NULL,
                        file_path     TEXT NOT NULL,
                        content_hash  TEXT NOT NULL,
                        updated_at    TEXT NOT NULL,
                        PRIMARY KEY (repository_id, file_path)
                    );

                    CREATE TABLE IF NOT EXISTS embeddings (
                        content_kind TEXT NOT NULL,
                        content_id   TEXT NOT NULL,
                        chunk_index  INTEGER NOT NULL,
                        chunk_text   TEXT NOT NULL,
                        metadata     TEXT,
                        vector       BLOB NOT NULL,
                        created_at   TEXT NOT NULL,
                        PRIMARY KEY (content_kind, content_id, chunk_index)
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Tickets
    // -----------------------------------------------------------------------

    pub async fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        let t = ticket.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tickets (id, repository_id, title, description, solution_plan,
                        status, priority, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
                    rusqlite::params![
                        t.id,
                        t.repository_id,
                        t.title,
                        t.description,
                        t.solution_plan,
                        enum_to_sql(&t.status),
                        t.priority,
                        ts_to_sql(&t.created_at),
                        ts_to_sql(&t.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, repository_id, title, description, solution_plan, status,
                            priority, created_at, updated_at
                     FROM tickets WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_ticket(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn list_tickets(&self) -> Result<Vec<Ticket>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, repository_id, title, description, solution_plan, status,
                            priority, created_at, updated_at
                     FROM tickets ORDER BY created_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_ticket(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Full-row update; bumps `updated_at` to now.
    pub async fn update_ticket(&self, ticket: &Ticket) -> Result<bool> {
        let t = ticket.clone();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tickets SET repository_id=?2, title=?3, description=?4,
                        solution_plan=?5, status=?6, priority=?7, updated_at=?8
                     WHERE id=?1",
                    rusqlite::params![
                        t.id,
                        t.repository_id,
                        t.title,
                        t.description,
                        t.solution_plan,
                        enum_to_sql(&t.status),
                        t.priority,
                        ts_to_sql(&Utc::now()),
                    ],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn set_ticket_status(&self, id: &str, status: TicketStatus) -> Result<bool> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE tickets SET status=?2, updated_at=?3 WHERE id=?1",
                    rusqlite::params![id, enum_to_sql(&status), ts_to_sql(&Utc::now())],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Delete a ticket. FK cascades remove comments, labels, and assignees;
    /// ticket embeddings are removed in the same transaction.
    pub async fn delete_ticket(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM embeddings WHERE content_kind='ticket' AND content_id=?1",
                    rusqlite::params![id],
                )?;
                let n = tx.execute("DELETE FROM tickets WHERE id=?1", rusqlite::params![id])?;
                tx.commit()?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Labels and assignees
    // -----------------------------------------------------------------------

    pub async fn upsert_label(&self, label: &Label) -> Result<()> {
        let l = label.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO label_defs (name, color) VALUES (?1,?2)
                     ON CONFLICT(name) DO UPDATE SET color=excluded.color",
                    rusqlite::params![l.name, l.color],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Replace a ticket's label set. Unknown labels are defined on the fly
    /// with a neutral color.
    pub async fn set_ticket_labels(&self, ticket_id: &str, names: Vec<String>) -> Result<()> {
        let ticket_id = ticket_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM ticket_labels WHERE ticket_id=?1",
                    rusqlite::params![ticket_id],
                )?;
                for name in &names {
                    tx.execute(
                        "INSERT OR IGNORE INTO label_defs (name, color) VALUES (?1, '#888888')",
                        rusqlite::params![name],
                    )?;
                    tx.execute(
                        "INSERT OR IGNORE INTO ticket_labels (ticket_id, label_name) VALUES (?1,?2)",
                        rusqlite::params![ticket_id, name],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn ticket_labels(&self, ticket_id: &str) -> Result<Vec<Label>> {
        let ticket_id = ticket_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT d.name, d.color FROM ticket_labels l
                     JOIN label_defs d ON d.name = l.label_name
                     WHERE l.ticket_id = ?1 ORDER BY d.name",
                )?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(Label {
                        name: row.get(0)?,
                        color: row.get(1)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn set_ticket_assignees(
        &self,
        ticket_id: &str,
        assignees: Vec<ActorRef>,
    ) -> Result<()> {
        let ticket_id = ticket_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM ticket_assignees WHERE ticket_id=?1",
                    rusqlite::params![ticket_id],
                )?;
                for a in &assignees {
                    tx.execute(
                        "INSERT OR IGNORE INTO ticket_assignees (ticket_id, assignee_kind, assignee_id)
                         VALUES (?1,?2,?3)",
                        rusqlite::params![ticket_id, enum_to_sql(&a.kind), a.id],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn ticket_assignees(&self, ticket_id: &str) -> Result<Vec<ActorRef>> {
        let ticket_id = ticket_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT assignee_kind, assignee_id FROM ticket_assignees
                     WHERE ticket_id=?1 ORDER BY assignee_kind, assignee_id",
                )?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let kind_str: String = row.get(0)?;
                    out.push(ActorRef {
                        kind: enum_from_sql::<ActorKind>(&kind_str),
                        id: row.get(1)?,
                    });
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Comments
    // -----------------------------------------------------------------------

    /// Insert a comment, assigning a `created_at` strictly greater than every
    /// existing comment on the same ticket so receivers can order by it.
    /// Returns the stored row (timestamps may differ from the input).
    pub async fn insert_comment(&self, comment: &Comment) -> Result<Comment> {
        let mut c = comment.clone();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let last: Option<String> = tx.query_row(
                    "SELECT MAX(created_at) FROM comments WHERE ticket_id=?1",
                    rusqlite::params![c.ticket_id],
                    |r| r.get(0),
                )?;

                let mut created = Utc::now();
                if let Some(last) = last {
                    let last_ts = ts_from_sql(&last);
                    if created <= last_ts {
                        created = last_ts + Duration::milliseconds(1);
                    }
                }
                c.created_at = created;
                c.updated_at = created;

                tx.execute(
                    "INSERT INTO comments (id, ticket_id, author_kind, author_id, content,
                        mentions, status, responding_to, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    rusqlite::params![
                        c.id,
                        c.ticket_id,
                        enum_to_sql(&c.author.kind),
                        c.author.id,
                        c.content,
                        c.mentions.as_ref().map(|m| serde_json::to_string(m).expect("valid json")),
                        enum_to_sql(&c.status),
                        c.responding_to,
                        ts_to_sql(&c.created_at),
                        ts_to_sql(&c.updated_at),
                    ],
                )?;
                tx.commit()?;
                Ok(c)
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn get_comment(&self, id: &str) -> Result<Option<Comment>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ticket_id, author_kind, author_id, content, mentions,
                            status, responding_to, created_at, updated_at
                     FROM comments WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_comment(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn list_comments(&self, ticket_id: &str) -> Result<Vec<Comment>> {
        let ticket_id = ticket_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ticket_id, author_kind, author_id, content, mentions,
                            status, responding_to, created_at, updated_at
                     FROM comments WHERE ticket_id = ?1 ORDER BY created_at ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![ticket_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_comment(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Update a comment's content (streaming chunk append or plain edit).
    pub async fn update_comment_content(&self, id: &str, content: &str) -> Result<bool> {
        let id = id.to_string();
        let content = content.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE comments SET content=?2, updated_at=?3 WHERE id=?1",
                    rusqlite::params![id, content, ts_to_sql(&Utc::now())],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Set a comment's status, optionally replacing the content in the same
    /// statement (finalization of a streamed comment).
    pub async fn finish_comment(
        &self,
        id: &str,
        content: Option<&str>,
        status: CommentStatus,
    ) -> Result<bool> {
        let id = id.to_string();
        let content = content.map(|c| c.to_string());
        self.conn
            .call(move |conn| {
                let n = match content {
                    Some(content) => conn.execute(
                        "UPDATE comments SET content=?2, status=?3, updated_at=?4 WHERE id=?1",
                        rusqlite::params![id, content, enum_to_sql(&status), ts_to_sql(&Utc::now())],
                    )?,
                    None => conn.execute(
                        "UPDATE comments SET status=?2, updated_at=?3 WHERE id=?1",
                        rusqlite::params![id, enum_to_sql(&status), ts_to_sql(&Utc::now())],
                    )?,
                };
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Generating comments whose `updated_at` is older than the cutoff.
    /// Used by the sweeper that fails orphaned streaming placeholders.
    pub async fn stale_generating_comments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Comment>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ticket_id, author_kind, author_id, content, mentions,
                            status, responding_to, created_at, updated_at
                     FROM comments WHERE status='generating' AND updated_at < ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![ts_to_sql(&cutoff)])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_comment(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Agents
    // -----------------------------------------------------------------------

    pub async fn insert_agent(&self, agent: &AgentRecord) -> Result<()> {
        let a = agent.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agents (id, name, kind, enabled, config, description,
                        created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
                    rusqlite::params![
                        a.id,
                        a.name,
                        enum_to_sql(&a.kind),
                        a.enabled as i64,
                        a.config.as_ref().map(|v| v.to_string()),
                        a.description,
                        ts_to_sql(&a.created_at),
                        ts_to_sql(&a.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn get_agent(&self, id: &str) -> Result<Option<AgentRecord>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, enabled, config, description, created_at, updated_at
                     FROM agents WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Case-insensitive name lookup (mention resolution).
    pub async fn get_agent_by_name(&self, name: &str) -> Result<Option<AgentRecord>> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, enabled, config, description, created_at, updated_at
                     FROM agents WHERE name = ?1 COLLATE NOCASE",
                )?;
                let mut rows = stmt.query(rusqlite::params![name])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, enabled, config, description, created_at, updated_at
                     FROM agents ORDER BY name COLLATE NOCASE",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_agent(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// The first enabled agent of the given kind, by name order. Dispatch
    /// targets must be enabled.
    pub async fn first_enabled_agent_of_kind(
        &self,
        kind: AgentKind,
    ) -> Result<Option<AgentRecord>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, kind, enabled, config, description, created_at, updated_at
                     FROM agents WHERE kind = ?1 AND enabled = 1
                     ORDER BY name COLLATE NOCASE LIMIT 1",
                )?;
                let mut rows = stmt.query(rusqlite::params![enum_to_sql(&kind)])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_agent(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn update_agent(&self, agent: &AgentRecord) -> Result<bool> {
        let a = agent.clone();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agents SET name=?2, kind=?3, enabled=?4, config=?5,
                        description=?6, updated_at=?7
                     WHERE id=?1",
                    rusqlite::params![
                        a.id,
                        a.name,
                        enum_to_sql(&a.kind),
                        a.enabled as i64,
                        a.config.as_ref().map(|v| v.to_string()),
                        a.description,
                        ts_to_sql(&Utc::now()),
                    ],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Delete an agent. The FK cascade removes its tasks.
    pub async fn delete_agent(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM agents WHERE id=?1", rusqlite::params![id])?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    pub async fn insert_document(&self, doc: &Document) -> Result<()> {
        let d = doc.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO documents (id, title, content, created_at, updated_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![
                        d.id,
                        d.title,
                        d.content,
                        ts_to_sql(&d.created_at),
                        ts_to_sql(&d.updated_at),
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, title, content, created_at, updated_at
                     FROM documents WHERE id = ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(Document {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                        created_at: ts_from_sql(&row.get::<_, String>(3)?),
                        updated_at: ts_from_sql(&row.get::<_, String>(4)?),
                    })),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn update_document(&self, doc: &Document) -> Result<bool> {
        let d = doc.clone();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE documents SET title=?2, content=?3, updated_at=?4 WHERE id=?1",
                    rusqlite::params![d.id, d.title, d.content, ts_to_sql(&Utc::now())],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Delete a document. FK cascades remove label links; chunks are removed
    /// in the same transaction.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM embeddings WHERE content_kind='doc' AND content_id=?1",
                    rusqlite::params![id],
                )?;
                let n = tx.execute("DELETE FROM documents WHERE id=?1", rusqlite::params![id])?;
                tx.commit()?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Agent tasks
    // -----------------------------------------------------------------------

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let t = task.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO agent_tasks (id, agent_id, task_type, payload, priority,
                        status, created_at, started_at, completed_at, error)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
                    rusqlite::params![
                        t.id,
                        t.agent_id,
                        enum_to_sql(&t.task_type),
                        t.payload.to_string(),
                        t.priority,
                        enum_to_sql(&t.status),
                        ts_to_sql(&t.created_at),
                        t.started_at.as_ref().map(ts_to_sql),
                        t.completed_at.as_ref().map(ts_to_sql),
                        t.error,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agent_tasks WHERE id = ?1",
                    TASK_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_task(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Claim the best pending task for an agent: highest priority first, then
    /// oldest. The pending -> processing flip is a guarded single-row UPDATE,
    /// so concurrent claimants (even in other processes) can never both win
    /// the same task; losers retry on the next candidate.
    pub async fn claim_next_task(&self, agent_id: &str) -> Result<Option<Task>> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                loop {
                    let candidate: Option<String> = {
                        let mut stmt = conn.prepare(
                            "SELECT id FROM agent_tasks
                             WHERE agent_id = ?1 AND status = 'pending'
                             ORDER BY priority DESC, created_at ASC LIMIT 1",
                        )?;
                        let mut rows = stmt.query(rusqlite::params![agent_id])?;
                        match rows.next()? {
                            Some(row) => Some(row.get(0)?),
                            None => None,
                        }
                    };

                    let Some(task_id) = candidate else {
                        return Ok(None);
                    };

                    let n = conn.execute(
                        "UPDATE agent_tasks SET status='processing', started_at=?2
                         WHERE id=?1 AND status='pending'",
                        rusqlite::params![task_id, ts_to_sql(&Utc::now())],
                    )?;
                    if n == 1 {
                        let mut stmt = conn.prepare(&format!(
                            "SELECT {} FROM agent_tasks WHERE id = ?1",
                            TASK_COLUMNS
                        ))?;
                        let mut rows = stmt.query(rusqlite::params![task_id])?;
                        if let Some(row) = rows.next()? {
                            return Ok(Some(row_to_task(row)?));
                        }
                        return Ok(None);
                    }
                    // Lost the race on this candidate; try the next one.
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    /// CAS-claim a specific task by id.
    pub async fn claim_task(&self, id: &str) -> Result<ClaimOutcome> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agent_tasks SET status='processing', started_at=?2
                     WHERE id=?1 AND status='pending'",
                    rusqlite::params![id, ts_to_sql(&Utc::now())],
                )?;
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agent_tasks WHERE id = ?1",
                    TASK_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => {
                        let task = row_to_task(row)?;
                        if n == 1 {
                            Ok(ClaimOutcome::Claimed(task))
                        } else {
                            Ok(ClaimOutcome::Conflict(task.status))
                        }
                    }
                    None => Ok(ClaimOutcome::NotFound),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Terminal transition. Idempotent: finishing an already-terminal task
    /// changes nothing and reports success. Returns whether a row changed.
    pub async fn finish_task(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let id = id.to_string();
        let error = error.map(|e| e.to_string());
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agent_tasks SET status=?2, completed_at=?3, error=?4
                     WHERE id=?1 AND status IN ('pending','processing')",
                    rusqlite::params![id, enum_to_sql(&status), ts_to_sql(&Utc::now()), error],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Ordered snapshot of pending tasks for catch-up. Concurrent enqueues
    /// after the snapshot may not appear.
    pub async fn list_pending_tasks(&self, agent_id: &str) -> Result<Vec<Task>> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM agent_tasks
                     WHERE agent_id = ?1 AND status = 'pending'
                     ORDER BY priority DESC, created_at ASC",
                    TASK_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![agent_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_task(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Requeue this agent's processing rows (interrupted on a previous run)
    /// as pending so they are re-claimed in order. `started_at` is kept: the
    /// rows have been processing once. Returns the number requeued.
    pub async fn reset_processing_tasks(&self, agent_id: &str) -> Result<usize> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE agent_tasks SET status='pending'
                     WHERE agent_id = ?1 AND status = 'processing'",
                    rusqlite::params![agent_id],
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn task_stats(&self, agent_id: &str) -> Result<TaskStats> {
        let agent_id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT status, COUNT(*) FROM agent_tasks
                     WHERE agent_id = ?1 GROUP BY status",
                )?;
                let mut rows = stmt.query(rusqlite::params![agent_id])?;
                let mut stats = TaskStats::default();
                while let Some(row) = rows.next()? {
                    let status_str: String = row.get(0)?;
                    let count: u64 = row.get(1)?;
                    match enum_from_sql::<TaskStatus>(&status_str) {
                        TaskStatus::Pending => stats.pending = count,
                        TaskStatus::Processing => stats.processing = count,
                        TaskStatus::Completed => stats.completed = count,
                        TaskStatus::Failed => stats.failed = count,
                    }
                }
                Ok(stats)
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn task_stats_all(&self) -> Result<Vec<(String, TaskStats)>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT agent_id, status, COUNT(*) FROM agent_tasks
                     GROUP BY agent_id, status ORDER BY agent_id",
                )?;
                let mut rows = stmt.query([])?;
                let mut out: Vec<(String, TaskStats)> = Vec::new();
                while let Some(row) = rows.next()? {
                    let agent_id: String = row.get(0)?;
                    let status_str: String = row.get(1)?;
                    let count: u64 = row.get(2)?;
                    if out.last().map(|(id, _)| id != &agent_id).unwrap_or(true) {
                        out.push((agent_id.clone(), TaskStats::default()));
                    }
                    let (_, stats) = out.last_mut().expect("just pushed");
                    match enum_from_sql::<TaskStatus>(&status_str) {
                        TaskStatus::Pending => stats.pending = count,
                        TaskStatus::Processing => stats.processing = count,
                        TaskStatus::Completed => stats.completed = count,
                        TaskStatus::Failed => stats.failed = count,
                    }
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Indexing jobs
    // -----------------------------------------------------------------------

    pub async fn insert_index_job(&self, job: &IndexJob) -> Result<()> {
        let j = job.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO index_jobs (id, kind, repository_id, file_path, doc_id,
                        ticket_id, status, created_at, started_at, completed_at, error)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11)",
                    rusqlite::params![
                        j.id,
                        enum_to_sql(&j.kind),
                        j.repository_id,
                        j.file_path,
                        j.doc_id,
                        j.ticket_id,
                        enum_to_sql(&j.status),
                        ts_to_sql(&j.created_at),
                        j.started_at.as_ref().map(ts_to_sql),
                        j.completed_at.as_ref().map(ts_to_sql),
                        j.error,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn get_index_job(&self, id: &str) -> Result<Option<IndexJob>> {
        let id = id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM index_jobs WHERE id = ?1",
                    INDEX_JOB_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_index_job(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Atomically claim up to `limit` oldest pending jobs, flipping them to
    /// processing with `started_at` set, and return them oldest-first.
    pub async fn claim_index_jobs(&self, limit: usize) -> Result<Vec<IndexJob>> {
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids: Vec<String> = {
                    let mut stmt = tx.prepare(
                        "SELECT id FROM index_jobs WHERE status='pending'
                         ORDER BY created_at ASC LIMIT ?1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![limit as i64])?;
                    let mut ids = Vec::new();
                    while let Some(row) = rows.next()? {
                        ids.push(row.get(0)?);
                    }
                    ids
                };

                let now = ts_to_sql(&Utc::now());
                let mut claimed = Vec::new();
                for id in &ids {
                    let n = tx.execute(
                        "UPDATE index_jobs SET status='processing', started_at=?2
                         WHERE id=?1 AND status='pending'",
                        rusqlite::params![id, now],
                    )?;
                    if n == 1 {
                        let mut stmt = tx.prepare(&format!(
                            "SELECT {} FROM index_jobs WHERE id = ?1",
                            INDEX_JOB_COLUMNS
                        ))?;
                        let mut rows = stmt.query(rusqlite::params![id])?;
                        if let Some(row) = rows.next()? {
                            claimed.push(row_to_index_job(row)?);
                        }
                    }
                }
                tx.commit()?;
                Ok(claimed)
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Terminal transition for a job; always records `completed_at`.
    pub async fn finish_index_job(
        &self,
        id: &str,
        status: TaskStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let id = id.to_string();
        let error = error.map(|e| e.to_string());
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "UPDATE index_jobs SET status=?2, completed_at=?3, error=?4
                     WHERE id=?1 AND status IN ('pending','processing')",
                    rusqlite::params![id, enum_to_sql(&status), ts_to_sql(&Utc::now()), error],
                )?;
                Ok(n == 1)
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn list_index_jobs(&self, status: TaskStatus) -> Result<Vec<IndexJob>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM index_jobs WHERE status = ?1 ORDER BY created_at ASC",
                    INDEX_JOB_COLUMNS
                ))?;
                let mut rows = stmt.query(rusqlite::params![enum_to_sql(&status)])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_index_job(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }

    // -----------------------------------------------------------------------
    // Embeddings
    // -----------------------------------------------------------------------

    pub async fn code_file_hash(
        &self,
        repository_id: &str,
        file_path: &str,
    ) -> Result<Option<String>> {
        let repository_id = repository_id.to_string();
        let file_path = file_path.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT content_hash FROM code_file_hashes
                     WHERE repository_id=?1 AND file_path=?2",
                )?;
                let mut rows = stmt.query(rusqlite::params![repository_id, file_path])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn set_code_file_hash(
        &self,
        repository_id: &str,
        file_path: &str,
        hash: &str,
    ) -> Result<()> {
        let repository_id = repository_id.to_string();
        let file_path = file_path.to_string();
        let hash = hash.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO code_file_hashes (repository_id, file_path, content_hash, updated_at)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(repository_id, file_path) DO UPDATE SET
                        content_hash=excluded.content_hash, updated_at=excluded.updated_at",
                    rusqlite::params![repository_id, file_path, hash, ts_to_sql(&Utc::now())],
                )?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    /// Replace all chunks for one content item in a single transaction:
    /// prior rows are retired, the new set is inserted.
    pub async fn replace_embeddings(
        &self,
        kind: ContentKind,
        content_id: &str,
        rows: Vec<EmbeddingRow>,
    ) -> Result<()> {
        for row in &rows {
            if row.vector.len() != self.embedding_dim {
                return Err(StoreError::DimensionMismatch {
                    expected: self.embedding_dim,
                    actual: row.vector.len(),
                });
            }
        }
        let content_id = content_id.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM embeddings WHERE content_kind=?1 AND content_id=?2",
                    rusqlite::params![enum_to_sql(&kind), content_id],
                )?;
                let now = ts_to_sql(&Utc::now());
                for row in &rows {
                    tx.execute(
                        "INSERT INTO embeddings (content_kind, content_id, chunk_index,
                            chunk_text, metadata, vector, created_at)
                         VALUES (?1,?2,?3,?4,?5,?6,?7)",
                        rusqlite::params![
                            enum_to_sql(&kind),
                            content_id,
                            row.chunk_index,
                            row.chunk_text,
                            row.metadata.as_ref().map(|m| m.to_string()),
                            vector_to_blob(&row.vector),
                            now,
                        ],
                    )?;
                }
                tx.commit()?;
                Ok(())
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn delete_embeddings(&self, kind: ContentKind, content_id: &str) -> Result<usize> {
        let content_id = content_id.to_string();
        self.conn
            .call(move |conn| {
                let n = conn.execute(
                    "DELETE FROM embeddings WHERE content_kind=?1 AND content_id=?2",
                    rusqlite::params![enum_to_sql(&kind), content_id],
                )?;
                Ok(n)
            })
            .await
            .map_err(StoreError::Db)
    }

    pub async fn embeddings_for(
        &self,
        kind: ContentKind,
        content_id: &str,
    ) -> Result<Vec<EmbeddingRow>> {
        let content_id = content_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT chunk_index, chunk_text, metadata, vector FROM embeddings
                     WHERE content_kind=?1 AND content_id=?2 ORDER BY chunk_index ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![enum_to_sql(&kind), content_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let metadata_str: Option<String> = row.get(2)?;
                    let blob: Vec<u8> = row.get(3)?;
                    out.push(EmbeddingRow {
                        chunk_index: row.get(0)?,
                        chunk_text: row.get(1)?,
                        metadata: metadata_str
                            .map(|s| serde_json::from_str(&s).expect("valid json")),
                        vector: vector_from_blob(&blob),
                    });
                }
                Ok(out)
            })
            .await
            .map_err(StoreError::Db)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const TASK_COLUMNS: &str =
    "id, agent_id, task_type, payload, priority, status, created_at, started_at, completed_at, error";

const INDEX_JOB_COLUMNS: &str =
    "id, kind, repository_id, file_path, doc_id, ticket_id, status, created_at, started_at, completed_at, error";

fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    let status_str: String = row.get(5)?;
    let created_at_str: String = row.get(7)?;
    let updated_at_str: String = row.get(8)?;
    Ok(Ticket {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        solution_plan: row.get(4)?,
        status: enum_from_sql(&status_str),
        priority: row.get(6)?,
        created_at: ts_from_sql(&created_at_str),
        updated_at: ts_from_sql(&updated_at_str),
    })
}

fn row_to_comment(row: &rusqlite::Row<'_>) -> rusqlite::Result<Comment> {
    let author_kind_str: String = row.get(2)?;
    let mentions_str: Option<String> = row.get(5)?;
    let status_str: String = row.get(6)?;
    let created_at_str: String = row.get(8)?;
    let updated_at_str: String = row.get(9)?;
    Ok(Comment {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        author: ActorRef {
            kind: enum_from_sql(&author_kind_str),
            id: row.get(3)?,
        },
        content: row.get(4)?,
        mentions: mentions_str.map(|s| serde_json::from_str(&s).expect("valid json")),
        status: enum_from_sql(&status_str),
        responding_to: row.get(7)?,
        created_at: ts_from_sql(&created_at_str),
        updated_at: ts_from_sql(&updated_at_str),
    })
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let kind_str: String = row.get(2)?;
    let enabled: i64 = row.get(3)?;
    let config_str: Option<String> = row.get(4)?;
    let created_at_str: String = row.get(6)?;
    let updated_at_str: String = row.get(7)?;
    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: enum_from_sql(&kind_str),
        enabled: enabled != 0,
        config: config_str.map(|s| serde_json::from_str(&s).expect("valid json")),
        description: row.get(5)?,
        created_at: ts_from_sql(&created_at_str),
        updated_at: ts_from_sql(&updated_at_str),
    })
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let type_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let status_str: String = row.get(5)?;
    let created_at_str: String = row.get(6)?;
    let started_at_str: Option<String> = row.get(7)?;
    let completed_at_str: Option<String> = row.get(8)?;
    Ok(Task {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        task_type: enum_from_sql::<TaskType>(&type_str),
        payload: serde_json::from_str(&payload_str).expect("valid json"),
        priority: row.get(4)?,
        status: enum_from_sql(&status_str),
        created_at: ts_from_sql(&created_at_str),
        started_at: started_at_str.map(|s| ts_from_sql(&s)),
        completed_at: completed_at_str.map(|s| ts_from_sql(&s)),
        error: row.get(9)?,
    })
}

fn row_to_index_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexJob> {
    let kind_str: String = row.get(1)?;
    let status_str: String = row.get(6)?;
    let created_at_str: String = row.get(7)?;
    let started_at_str: Option<String> = row.get(8)?;
    let completed_at_str: Option<String> = row.get(9)?;
    Ok(IndexJob {
        id: row.get(0)?,
        kind: enum_from_sql::<IndexJobKind>(&kind_str),
        repository_id: row.get(2)?,
        file_path: row.get(3)?,
        doc_id: row.get(4)?,
        ticket_id: row.get(5)?,
        status: enum_from_sql(&status_str),
        created_at: ts_from_sql(&created_at_str),
        started_at: started_at_str.map(|s| ts_from_sql(&s)),
        completed_at: completed_at_str.map(|s| ts_from_sql(&s)),
        error: row.get(10)?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

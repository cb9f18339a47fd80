use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use fm_bridge::event_bus::EventBus;
use fm_bridge::protocol::{events, topics, EventEnvelope};
use fm_core::shutdown::ShutdownSignal;
use fm_core::store::{StoreDb, StoreError};
use fm_core::types::{ActorRef, Comment, CommentStatus};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("comment not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, StreamingError>;

// ---------------------------------------------------------------------------
// StreamingMessages
// ---------------------------------------------------------------------------

/// Life cycle of comments produced incrementally by agents.
///
/// A streamed comment is born with status=generating (a provisional row),
/// grows through content updates, and is finalized to completed. Every step
/// broadcasts a delta on `/tickets` so clients can render progress; receivers
/// order by `created_at`, which the store keeps monotonic per ticket.
#[derive(Clone)]
pub struct StreamingMessages {
    store: Arc<StoreDb>,
    bus: EventBus,
}

impl StreamingMessages {
    pub fn new(store: Arc<StoreDb>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    /// Insert the generating placeholder and broadcast `comment:created`.
    pub async fn create(
        &self,
        ticket_id: &str,
        author: ActorRef,
        initial_content: &str,
        responding_to: Option<String>,
    ) -> Result<Comment> {
        let mut comment = Comment::new(ticket_id, author, initial_content);
        comment.status = CommentStatus::Generating;
        comment.responding_to = responding_to;
        let stored = self.store.insert_comment(&comment).await?;
        self.broadcast(&stored, events::COMMENT_CREATED);
        Ok(stored)
    }

    /// Replace the provisional content and broadcast `comment:updated`.
    pub async fn update(&self, comment_id: &str, content: &str) -> Result<Comment> {
        if !self.store.update_comment_content(comment_id, content).await? {
            return Err(StreamingError::NotFound(comment_id.to_string()));
        }
        let comment = self.load(comment_id).await?;
        self.broadcast(&comment, events::COMMENT_UPDATED);
        Ok(comment)
    }

    /// Flip to completed (optionally with final content) and broadcast
    /// `comment:completed`. The final content wins over any earlier update.
    pub async fn finalize(&self, comment_id: &str, content: Option<&str>) -> Result<Comment> {
        if !self
            .store
            .finish_comment(comment_id, content, CommentStatus::Completed)
            .await?
        {
            return Err(StreamingError::NotFound(comment_id.to_string()));
        }
        let comment = self.load(comment_id).await?;
        self.broadcast(&comment, events::COMMENT_COMPLETED);
        Ok(comment)
    }

    /// Mark an orphaned or aborted stream as failed and broadcast the delta.
    pub async fn fail(&self, comment_id: &str) -> Result<Comment> {
        if !self
            .store
            .finish_comment(comment_id, None, CommentStatus::Failed)
            .await?
        {
            return Err(StreamingError::NotFound(comment_id.to_string()));
        }
        let comment = self.load(comment_id).await?;
        self.broadcast(&comment, events::COMMENT_UPDATED);
        Ok(comment)
    }

    /// Re-publish an event for a stored comment. Remote workers use the
    /// broadcast RPC to reach this after writing rows through the shared
    /// store.
    pub async fn rebroadcast(&self, comment_id: &str, event: &str) -> Result<Comment> {
        let comment = self.load(comment_id).await?;
        self.broadcast(&comment, event);
        Ok(comment)
    }

    async fn load(&self, comment_id: &str) -> Result<Comment> {
        self.store
            .get_comment(comment_id)
            .await?
            .ok_or_else(|| StreamingError::NotFound(comment_id.to_string()))
    }

    fn broadcast(&self, comment: &Comment, event: &str) {
        let envelope = EventEnvelope::new(
            event,
            serde_json::to_value(comment).unwrap_or(serde_json::Value::Null),
        );
        if let Err(e) = self.bus.publish(topics::TICKETS, envelope.to_value()) {
            warn!(comment_id = %comment.id, event = %event, error = %e, "comment broadcast dropped");
        }
    }

    /// Periodic sweep: any comment still generating past the staleness
    /// threshold belongs to a crashed worker and is transitioned to failed.
    pub fn spawn_sweeper(
        &self,
        stale_after: Duration,
        interval: Duration,
        shutdown: ShutdownSignal,
    ) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            let mut shutdown_rx = shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.sweep_once(stale_after).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    /// One sweep pass; returns how many comments were failed.
    pub async fn sweep_once(&self, stale_after: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
        let stale = match self.store.stale_generating_comments(cutoff).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "stale comment sweep failed");
                return 0;
            }
        };
        let mut failed = 0;
        for comment in stale {
            match self.fail(&comment.id).await {
                Ok(_) => {
                    info!(comment_id = %comment.id, ticket_id = %comment.ticket_id, "orphaned streaming comment failed");
                    failed += 1;
                }
                Err(e) => warn!(comment_id = %comment.id, error = %e, "could not fail stale comment"),
            }
        }
        failed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

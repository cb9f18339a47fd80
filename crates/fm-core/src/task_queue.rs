use std::sync::Arc;

use tracing::{debug, info};

use crate::store::{ClaimOutcome, StoreDb, StoreError};
use crate::types::{Task, TaskStats, TaskStatus, TaskType};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TaskQueueError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("task {id} is not pending (status: {status})")]
    Conflict { id: String, status: TaskStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, TaskQueueError>;

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// Per-agent prioritized FIFO whose authoritative state lives in the store.
///
/// Safe for concurrent claimants across processes: every pending -> processing
/// transition is a compare-and-swap on the status column. Terminal
/// transitions are idempotent; finishing an already-terminal task is a no-op
/// that reports success.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<StoreDb>,
}

impl TaskQueue {
    pub fn new(store: Arc<StoreDb>) -> Self {
        Self { store }
    }

    /// Insert a pending task and return it.
    pub async fn enqueue(
        &self,
        agent_id: &str,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<Task> {
        let task = Task::new(agent_id, task_type, payload, priority);
        self.store.insert_task(&task).await?;
        info!(
            task_id = %task.id,
            agent_id = %agent_id,
            task_type = %task_type,
            priority,
            "task enqueued"
        );
        Ok(task)
    }

    /// Claim the highest-priority pending task for an agent, flipping it to
    /// processing with `started_at` set. Returns `None` when nothing is
    /// pending.
    pub async fn claim_next(&self, agent_id: &str) -> Result<Option<Task>> {
        let claimed = self.store.claim_next_task(agent_id).await?;
        if let Some(ref task) = claimed {
            debug!(task_id = %task.id, agent_id = %agent_id, "task claimed");
        }
        Ok(claimed)
    }

    /// CAS-claim a specific task. Fails with `Conflict` when the task is not
    /// pending; callers skip to the next task or exit.
    pub async fn claim(&self, task_id: &str) -> Result<Task> {
        match self.store.claim_task(task_id).await? {
            ClaimOutcome::Claimed(task) => Ok(task),
            ClaimOutcome::Conflict(status) => Err(TaskQueueError::Conflict {
                id: task_id.to_string(),
                status,
            }),
            ClaimOutcome::NotFound => Err(TaskQueueError::NotFound(task_id.to_string())),
        }
    }

    /// Idempotent terminal transition to completed.
    pub async fn mark_completed(&self, task_id: &str) -> Result<()> {
        let changed = self
            .store
            .finish_task(task_id, TaskStatus::Completed, None)
            .await?;
        if changed {
            debug!(task_id = %task_id, "task completed");
        }
        Ok(())
    }

    /// Idempotent terminal transition to failed with the error recorded.
    pub async fn mark_failed(&self, task_id: &str, error: &str) -> Result<()> {
        let changed = self
            .store
            .finish_task(task_id, TaskStatus::Failed, Some(error))
            .await?;
        if changed {
            debug!(task_id = %task_id, error = %error, "task failed");
        }
        Ok(())
    }

    /// Ordered snapshot of pending tasks for reconnect catch-up. Concurrent
    /// enqueues after the snapshot may not appear.
    pub async fn list_pending(&self, agent_id: &str) -> Result<Vec<Task>> {
        Ok(self.store.list_pending_tasks(agent_id).await?)
    }

    /// Requeue an agent's interrupted processing rows as pending. Used by the
    /// worker before catch-up; replay is defended by idempotent behaviors.
    pub async fn reclaim_processing(&self, agent_id: &str) -> Result<usize> {
        let n = self.store.reset_processing_tasks(agent_id).await?;
        if n > 0 {
            info!(agent_id = %agent_id, count = n, "requeued interrupted tasks");
        }
        Ok(n)
    }

    pub async fn stats(&self, agent_id: &str) -> Result<TaskStats> {
        Ok(self.store.task_stats(agent_id).await?)
    }

    pub async fn stats_all(&self) -> Result<Vec<(String, TaskStats)>> {
        Ok(self.store.task_stats_all().await?)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self.store.get_task(task_id).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::sync::Arc;

use tracing::{debug, warn};

use crate::store::StoreDb;
use crate::types::IndexJob;

/// Enqueue surface for indexing jobs.
///
/// Calls are non-blocking from the caller's point of view: enqueue failures
/// are logged and swallowed so a broken indexing pipeline never fails a
/// ticket or comment request.
#[derive(Clone)]
pub struct IndexQueue {
    store: Arc<StoreDb>,
}

impl IndexQueue {
    pub fn new(store: Arc<StoreDb>) -> Self {
        Self { store }
    }

    /// Queue a code-file job. Returns the job id when the insert succeeded.
    pub async fn queue_code(&self, repository_id: &str, file_path: &str) -> Option<String> {
        self.queue(IndexJob::code(repository_id, file_path)).await
    }

    /// Queue a document job.
    pub async fn queue_doc(&self, doc_id: &str) -> Option<String> {
        self.queue(IndexJob::doc(doc_id)).await
    }

    /// Queue a ticket job.
    pub async fn queue_ticket(&self, ticket_id: &str) -> Option<String> {
        self.queue(IndexJob::ticket(ticket_id)).await
    }

    async fn queue(&self, job: IndexJob) -> Option<String> {
        let id = job.id.clone();
        match self.store.insert_index_job(&job).await {
            Ok(()) => {
                debug!(job_id = %id, kind = %job.kind, target = %job.target(), "indexing job queued");
                Some(id)
            }
            Err(e) => {
                warn!(kind = %job.kind, target = %job.target(), error = %e, "failed to queue indexing job");
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IndexJobKind, TaskStatus};

    #[tokio::test]
    async fn queue_inserts_pending_rows() {
        let store = Arc::new(StoreDb::new_in_memory(4).await.unwrap());
        let queue = IndexQueue::new(store.clone());

        let id = queue.queue_ticket("t1").await.unwrap();
        let job = store.get_index_job(&id).await.unwrap().unwrap();
        assert_eq!(job.kind, IndexJobKind::Ticket);
        assert_eq!(job.ticket_id.as_deref(), Some("t1"));
        assert_eq!(job.status, TaskStatus::Pending);

        let id = queue.queue_code("r1", "/src/a.ts").await.unwrap();
        let job = store.get_index_job(&id).await.unwrap().unwrap();
        assert_eq!(job.kind, IndexJobKind::Code);
        assert_eq!(job.repository_id.as_deref(), Some("r1"));
        assert_eq!(job.file_path.as_deref(), Some("/src/a.ts"));
        assert!(job.doc_id.is_none());
    }
}

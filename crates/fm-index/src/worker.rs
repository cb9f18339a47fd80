use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use fm_core::config::IndexingConfig;
use fm_core::shutdown::ShutdownSignal;
use fm_core::store::StoreDb;
use fm_core::types::{ContentKind, EmbeddingRow, IndexJob, IndexJobKind, TaskStatus};

use crate::chunker::{chunk_code, chunk_markdown};
use crate::embedder::Embedder;

// ---------------------------------------------------------------------------
// IndexWorker
// ---------------------------------------------------------------------------

enum JobResult {
    Indexed(usize),
    /// Content hash unchanged; no rows inserted, none deleted.
    Skipped,
}

/// Drains the indexing-job queue with bounded parallelism.
///
/// Every poll claims up to `max_parallel_jobs` oldest pending jobs in one
/// transaction and dispatches them concurrently. Terminal transitions always
/// record `completed_at`; job failures are recorded, never retried
/// automatically.
pub struct IndexWorker {
    store: Arc<StoreDb>,
    embedder: Arc<dyn Embedder>,
    repos_root: PathBuf,
    cfg: IndexingConfig,
}

impl IndexWorker {
    pub fn new(
        store: Arc<StoreDb>,
        embedder: Arc<dyn Embedder>,
        repos_root: impl Into<PathBuf>,
        cfg: IndexingConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            repos_root: repos_root.into(),
            cfg,
        }
    }

    /// Poll loop: runs until shutdown.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(self.cfg.poll_interval_secs));
        let mut shutdown_rx = shutdown.subscribe();
        info!(
            poll_secs = self.cfg.poll_interval_secs,
            batch = self.cfg.max_parallel_jobs,
            "indexing worker started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_once().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("indexing worker stopping");
                    return;
                }
            }
        }
    }

    /// Claim and process one batch. Returns how many jobs were handled.
    pub async fn drain_once(&self) -> usize {
        let jobs = match self.store.claim_index_jobs(self.cfg.max_parallel_jobs).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "indexing batch claim failed");
                return 0;
            }
        };
        if jobs.is_empty() {
            return 0;
        }
        let count = jobs.len();
        join_all(jobs.into_iter().map(|job| self.handle_job(job))).await;
        count
    }

    async fn handle_job(&self, job: IndexJob) {
        let result = match job.kind {
            IndexJobKind::Code => self.index_code(&job).await,
            IndexJobKind::Doc => self.index_doc(&job).await,
            IndexJobKind::Ticket => self.index_ticket(&job).await,
        };

        let finish = match result {
            Ok(JobResult::Indexed(chunks)) => {
                info!(job_id = %job.id, kind = %job.kind, target = %job.target(), chunks, "indexing job completed");
                self.store
                    .finish_index_job(&job.id, TaskStatus::Completed, None)
                    .await
            }
            Ok(JobResult::Skipped) => {
                debug!(job_id = %job.id, target = %job.target(), "content unchanged, indexing skipped");
                self.store
                    .finish_index_job(&job.id, TaskStatus::Completed, None)
                    .await
            }
            Err(message) => {
                warn!(job_id = %job.id, kind = %job.kind, target = %job.target(), error = %message, "indexing job failed");
                self.store
                    .finish_index_job(&job.id, TaskStatus::Failed, Some(&message))
                    .await
            }
        };
        if let Err(e) = finish {
            warn!(job_id = %job.id, error = %e, "could not record indexing job outcome");
        }
    }

    // -----------------------------------------------------------------------
    // Code files
    // -----------------------------------------------------------------------

    async fn index_code(&self, job: &IndexJob) -> Result<JobResult, String> {
        let repo = job
            .repository_id
            .as_deref()
            .ok_or_else(|| "code job missing repository_id".to_string())?;
        let file_path = job
            .file_path
            .as_deref()
            .ok_or_else(|| "code job missing file_path".to_string())?;

        let disk_path = self.resolve(repo, file_path);
        let content = tokio::fs::read_to_string(&disk_path)
            .await
            .map_err(|e| format!("read {}: {e}", disk_path.display()))?;

        let hash = content_hash(&content);
        let stored = self
            .store
            .code_file_hash(repo, file_path)
            .await
            .map_err(|e| e.to_string())?;
        if stored.as_deref() == Some(hash.as_str()) {
            return Ok(JobResult::Skipped);
        }

        let chunks = chunk_code(&content, self.cfg.fallback_window_lines);
        let mut rows = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let vector = self
                .embedder
                .embed(&chunk.text)
                .await
                .map_err(|e| format!("embedding failed: {e}"))?;
            rows.push(EmbeddingRow {
                chunk_index: index as i64,
                chunk_text: chunk.text.clone(),
                metadata: Some(json!({
                    "repository_id": repo,
                    "file_path": file_path,
                    "symbol": chunk.symbol,
                    "start_line": chunk.start_line,
                })),
                vector,
            });
        }
        let count = rows.len();

        let content_id = code_content_id(repo, file_path);
        self.store
            .replace_embeddings(ContentKind::Code, &content_id, rows)
            .await
            .map_err(|e| e.to_string())?;
        self.store
            .set_code_file_hash(repo, file_path, &hash)
            .await
            .map_err(|e| e.to_string())?;
        Ok(JobResult::Indexed(count))
    }

    fn resolve(&self, repo: &str, file_path: &str) -> PathBuf {
        self.repos_root
            .join(repo)
            .join(file_path.trim_start_matches('/'))
    }

    // -----------------------------------------------------------------------
    // Documents
    // -----------------------------------------------------------------------

    async fn index_doc(&self, job: &IndexJob) -> Result<JobResult, String> {
        let doc_id = job
            .doc_id
            .as_deref()
            .ok_or_else(|| "doc job missing doc_id".to_string())?;
        let doc = self
            .store
            .get_document(doc_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("document not found: {doc_id}"))?;

        let chunks = chunk_markdown(
            &doc.content,
            self.cfg.max_chunk_chars,
            self.cfg.chunk_overlap_chars,
        );
        let mut rows = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.iter().enumerate() {
            let vector = self
                .embedder
                .embed(&chunk.text)
                .await
                .map_err(|e| format!("embedding failed: {e}"))?;
            rows.push(EmbeddingRow {
                chunk_index: index as i64,
                chunk_text: chunk.text.clone(),
                metadata: Some(json!({
                    "doc_id": doc.id,
                    "title": doc.title,
                    "heading": chunk.heading,
                })),
                vector,
            });
        }
        let count = rows.len();
        self.store
            .replace_embeddings(ContentKind::Doc, doc_id, rows)
            .await
            .map_err(|e| e.to_string())?;
        Ok(JobResult::Indexed(count))
    }

    // -----------------------------------------------------------------------
    // Tickets
    // -----------------------------------------------------------------------

    async fn index_ticket(&self, job: &IndexJob) -> Result<JobResult, String> {
        let ticket_id = job
            .ticket_id
            .as_deref()
            .ok_or_else(|| "ticket job missing ticket_id".to_string())?;
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("ticket not found: {ticket_id}"))?;

        let text = ticket.embedding_text();
        let vector = self
            .embedder
            .embed(&text)
            .await
            .map_err(|e| format!("embedding failed: {e}"))?;
        let row = EmbeddingRow {
            chunk_index: 0,
            chunk_text: text,
            metadata: Some(json!({
                "ticket_id": ticket.id,
                "repository_id": ticket.repository_id,
            })),
            vector,
        };
        self.store
            .replace_embeddings(ContentKind::Ticket, ticket_id, vec![row])
            .await
            .map_err(|e| e.to_string())?;
        Ok(JobResult::Indexed(1))
    }
}

fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn code_content_id(repo: &str, file_path: &str) -> String {
    format!("{repo}:{file_path}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

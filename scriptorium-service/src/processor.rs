//! Batch embedding processor.
//!
//! A single continuously-running background task that, every processing
//! interval, drains the retry queue, drives pending documents through
//! chunking and embedding, and completes chunks that still lack embeddings.
//! Sustained cycle failures open a circuit breaker that suspends all work
//! until its timer elapses.

mod chunks;
mod documents;
mod retry;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunking::Chunker;
use crate::config::PipelineConfig;
use crate::db::{Chunk, Database, Document, EmbeddingStatus};
use crate::embedding::EmbeddingProvider;
use crate::error::{ErrorCategory, ServiceError, ServiceResult, format_error_chain};
use crate::workflow::WorkflowService;

/// What the circuit breaker allows this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerGate {
    Closed,
    HalfOpen,
    Open,
}

/// Failure-count-triggered gate suspending processing after repeated cycle
/// failures. Held in memory by one processor instance; never persisted.
struct CircuitBreaker {
    consecutive_failures: u32,
    open_until: Option<Instant>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            open_until: None,
            failure_threshold: failure_threshold.max(1),
            open_duration,
        }
    }

    /// Decide what this cycle may do. An elapsed timer resets the counter and
    /// grants one half-open probe cycle.
    fn gate(&mut self, now: Instant) -> BreakerGate {
        match self.open_until {
            Some(until) if until > now => BreakerGate::Open,
            Some(_) => {
                self.open_until = None;
                self.consecutive_failures = 0;
                BreakerGate::HalfOpen
            }
            None => BreakerGate::Closed,
        }
    }

    /// Count a failed cycle; returns true when this failure opens the
    /// breaker.
    fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            self.open_until = Some(now + self.open_duration);
            true
        } else {
            false
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

/// Circuit breaker introspection for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub open: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_remaining_secs: Option<u64>,
}

/// Outcome of one chunk embedding attempt.
enum EmbedOutcome {
    Embedded {
        chunk_id: String,
        vector: Vec<f32>,
    },
    NoVector {
        chunk_id: String,
        chunk_index: i64,
    },
    Failed {
        chunk_id: String,
        chunk_index: i64,
        error: ServiceError,
    },
    Skipped,
}

pub struct BatchEmbeddingProcessor {
    db: Arc<Database>,
    workflow: Arc<WorkflowService>,
    embedder: Arc<dyn EmbeddingProvider>,
    chunker: Arc<dyn Chunker>,
    config: PipelineConfig,
    breaker: Mutex<CircuitBreaker>,
    /// Documents currently being driven by this process, so the manual
    /// trigger and the background loop never double-claim one.
    in_flight: DashMap<String, ()>,
}

impl BatchEmbeddingProcessor {
    pub fn new(
        db: Arc<Database>,
        workflow: Arc<WorkflowService>,
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Arc<dyn Chunker>,
        config: PipelineConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_open_duration(),
        );
        Self {
            db,
            workflow,
            embedder,
            chunker,
            config,
            breaker: Mutex::new(breaker),
            in_flight: DashMap::new(),
        }
    }

    /// Spawn the background worker. One cycle fully finishes (including its
    /// sleep) before the next begins.
    pub fn start(
        processor: Arc<BatchEmbeddingProcessor>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = processor.config.processing_interval_secs,
                "batch embedding worker started"
            );
            let mut interval = tokio::time::interval(processor.config.processing_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("batch embedding worker stopping");
                        break;
                    }
                    _ = interval.tick() => {
                        processor.run_cycle(&shutdown).await;
                    }
                }
            }
        })
    }

    /// Run one full processing cycle: retry queue, document discovery, chunk
    /// completion. Pass failures are contained here and only feed the
    /// breaker; they never prevent the remaining passes from running.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) {
        match self.breaker.lock().unwrap().gate(Instant::now()) {
            BreakerGate::Open => {
                debug!("circuit breaker open, skipping cycle");
                counter!("pipeline_cycles_skipped_total").increment(1);
                return;
            }
            BreakerGate::HalfOpen => info!("circuit breaker half-open, probing"),
            BreakerGate::Closed => {}
        }
        counter!("pipeline_cycles_total").increment(1);

        let mut cycle_failed = false;

        if self.config.process_retry_queue && !shutdown.is_cancelled() {
            if let Err(e) = self.run_retry_pass(shutdown).await {
                error!(error = %format_error_chain(&e), "retry pass failed");
                cycle_failed = true;
            }
        }

        if !shutdown.is_cancelled() {
            if let Err(e) = self.run_document_pass(shutdown).await {
                error!(error = %format_error_chain(&e), "document chunk/embed pass failed");
                cycle_failed = true;
            }
        }

        if !shutdown.is_cancelled() {
            if let Err(e) = self.run_chunk_completion_pass(shutdown).await {
                error!(error = %format_error_chain(&e), "chunk embed-completion pass failed");
                cycle_failed = true;
            }
        }

        let mut breaker = self.breaker.lock().unwrap();
        if cycle_failed {
            counter!("pipeline_cycle_failures_total").increment(1);
            if breaker.record_failure(Instant::now()) {
                warn!(
                    failures = breaker.consecutive_failures,
                    open_secs = self.config.breaker_open_secs,
                    "circuit breaker opened"
                );
            }
        } else {
            breaker.record_success();
        }
    }

    /// Process one named document immediately (operator trigger).
    pub async fn process_single_document(
        &self,
        document_id: &str,
        shutdown: &CancellationToken,
    ) -> ServiceResult<()> {
        let doc = self
            .db
            .get_document(document_id)?
            .ok_or_else(|| ServiceError::DocumentNotFound {
                document_id: document_id.to_string(),
            })?;

        let Some(_claim) = self.claim(document_id) else {
            return Err(ServiceError::InvalidRequest {
                message: format!("document {document_id} is already being processed"),
            });
        };

        self.drive_document(&doc, shutdown).await
    }

    /// Sweep all pending work immediately (operator trigger): documents up to
    /// the configured batch size, then a chunk completion pass.
    pub async fn run_sweep(&self, shutdown: &CancellationToken) -> ServiceResult<usize> {
        let processed = self
            .process_discovered(self.config.max_batch_size, shutdown)
            .await?;
        self.run_chunk_completion_pass(shutdown).await?;
        Ok(processed)
    }

    /// Circuit breaker state for health reporting.
    pub fn breaker_status(&self) -> BreakerStatus {
        let breaker = self.breaker.lock().unwrap();
        let now = Instant::now();
        let remaining = breaker
            .open_until
            .filter(|until| *until > now)
            .map(|until| (until - now).as_secs());
        BreakerStatus {
            open: remaining.is_some(),
            consecutive_failures: breaker.consecutive_failures,
            open_remaining_secs: remaining,
        }
    }

    /// Claim a document for processing; `None` when another task owns it.
    fn claim(&self, document_id: &str) -> Option<Claim<'_>> {
        match self.in_flight.entry(document_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(());
                Some(Claim {
                    registry: &self.in_flight,
                    document_id: document_id.to_string(),
                })
            }
        }
    }

    /// Embed a batch of chunks with bounded concurrency, observing
    /// cancellation per item.
    async fn embed_chunk_batch(
        &self,
        chunks: Vec<Chunk>,
        shutdown: &CancellationToken,
    ) -> Vec<EmbedOutcome> {
        let concurrency = self.config.max_concurrency.max(1);
        futures::stream::iter(chunks.into_iter().map(|chunk| {
            let shutdown = shutdown.clone();
            async move {
                if shutdown.is_cancelled() {
                    return EmbedOutcome::Skipped;
                }
                match self.embedder.generate_embedding(&chunk.content).await {
                    Ok(Some(vector)) => EmbedOutcome::Embedded {
                        chunk_id: chunk.id,
                        vector,
                    },
                    Ok(None) => EmbedOutcome::NoVector {
                        chunk_id: chunk.id,
                        chunk_index: chunk.chunk_index,
                    },
                    Err(error) => EmbedOutcome::Failed {
                        chunk_id: chunk.id,
                        chunk_index: chunk.chunk_index,
                        error,
                    },
                }
            }
        }))
        .buffer_unordered(concurrency)
        .collect()
        .await
    }

    /// Sift embedding outcomes into persistable vectors, logging the rest.
    fn collect_embedded(&self, outcomes: Vec<EmbedOutcome>) -> Vec<(String, Vec<f32>)> {
        let mut embedded = Vec::new();
        for outcome in outcomes {
            match outcome {
                EmbedOutcome::Embedded { chunk_id, vector } => embedded.push((chunk_id, vector)),
                EmbedOutcome::NoVector {
                    chunk_id,
                    chunk_index,
                } => {
                    warn!(
                        chunk_id = %chunk_id,
                        chunk_index,
                        "provider returned no embedding for chunk"
                    );
                }
                EmbedOutcome::Failed {
                    chunk_id,
                    chunk_index,
                    error,
                } => {
                    warn!(
                        chunk_id = %chunk_id,
                        chunk_index,
                        error = %format_error_chain(&error),
                        "chunk embedding failed"
                    );
                }
                EmbedOutcome::Skipped => {}
            }
        }
        embedded
    }

    /// Drive one document through chunking and embedding, resetting it to
    /// Pending on failure so a later cycle can try again.
    async fn drive_document(
        &self,
        doc: &Document,
        shutdown: &CancellationToken,
    ) -> ServiceResult<()> {
        match self.process_one_document(doc, shutdown).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(
                    doc_id = %doc.id,
                    error = %format_error_chain(&e),
                    "document embedding failed, resetting to pending"
                );
                if let Err(reset_err) = self
                    .db
                    .update_embedding_status(&doc.id, EmbeddingStatus::Pending)
                {
                    warn!(
                        doc_id = %doc.id,
                        error = %format_error_chain(&reset_err),
                        "failed to reset document status"
                    );
                }
                let category = ErrorCategory::from_error(&e);
                if let Err(record_err) = self.workflow.record_error(&doc.id, &e, category) {
                    warn!(
                        doc_id = %doc.id,
                        error = %format_error_chain(&record_err),
                        "failed to record document error"
                    );
                }
                Err(e)
            }
        }
    }
}

/// In-flight claim on a document; released on drop.
struct Claim<'a> {
    registry: &'a DashMap<String, ()>,
    document_id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.document_id);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::EmbeddingError;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Scripted embedding provider: vectors of a fixed dimension, with
    /// substring-matched inputs yielding null results or errors.
    pub(crate) struct MockEmbedder {
        pub dim: usize,
        pub null_for: Mutex<Vec<String>>,
        pub fail_for: Mutex<Vec<String>>,
        pub calls: AtomicUsize,
    }

    impl MockEmbedder {
        pub fn new(dim: usize) -> Self {
            Self {
                dim,
                null_for: Mutex::new(Vec::new()),
                fail_for: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn null_for(self, pattern: &str) -> Self {
            self.null_for.lock().unwrap().push(pattern.to_string());
            self
        }

        pub fn clear_null(&self) {
            self.null_for.lock().unwrap().clear();
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl EmbeddingProvider for MockEmbedder {
        fn generate_embedding<'a>(
            &'a self,
            text: &'a str,
        ) -> BoxFuture<'a, ServiceResult<Option<Vec<f32>>>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self
                    .fail_for
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|p| text.contains(p.as_str()))
                {
                    return Err(EmbeddingError::Generation {
                        status: 500,
                        message: "mock provider failure".to_string(),
                    }
                    .into());
                }
                if self
                    .null_for
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|p| text.contains(p.as_str()))
                {
                    return Ok(None);
                }
                Ok(Some(vec![0.1; self.dim]))
            })
        }
    }

    /// One chunk per sentence, split on periods.
    pub(crate) struct SentenceChunker;

    impl Chunker for SentenceChunker {
        fn chunk_document(&self, document: &Document) -> ServiceResult<Vec<Chunk>> {
            let now = chrono::Utc::now();
            Ok(document
                .extracted_text
                .split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .enumerate()
                .map(|(i, sentence)| Chunk {
                    id: uuid::Uuid::new_v4().to_string(),
                    document_id: document.id.clone(),
                    chunk_index: i as i64,
                    content: sentence.to_string(),
                    title: None,
                    section: None,
                    keywords: Vec::new(),
                    importance: 0.5,
                    kind: crate::db::ChunkKind::Paragraph,
                    embedding: None,
                    embedding_dim: None,
                    created_at: now,
                })
                .collect())
        }
    }

    /// Chunker that always errors, for failure-isolation tests.
    pub(crate) struct FailingChunker;

    impl Chunker for FailingChunker {
        fn chunk_document(&self, _document: &Document) -> ServiceResult<Vec<Chunk>> {
            Err(ServiceError::InvalidRequest {
                message: "mock chunker failure".to_string(),
            })
        }
    }

    /// Chunker that produces nothing, for the not-required path.
    pub(crate) struct EmptyChunker;

    impl Chunker for EmptyChunker {
        fn chunk_document(&self, _document: &Document) -> ServiceResult<Vec<Chunk>> {
            Ok(Vec::new())
        }
    }

    pub(crate) fn test_config() -> PipelineConfig {
        PipelineConfig {
            max_batch_size: 16,
            max_concurrency: 2,
            processing_interval_secs: 1,
            retry_batch_size: 8,
            breaker_failure_threshold: 3,
            breaker_open_secs: 1,
            process_retry_queue: true,
            verbose_logging: false,
            default_max_retries: 3,
        }
    }

    pub(crate) fn build_processor(
        embedder: Arc<dyn EmbeddingProvider>,
        chunker: Arc<dyn Chunker>,
        config: PipelineConfig,
    ) -> (TempDir, Arc<Database>, BatchEmbeddingProcessor) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(&dir.path().join("test.db")).unwrap());
        let workflow = Arc::new(WorkflowService::new(db.clone()));
        let processor =
            BatchEmbeddingProcessor::new(db.clone(), workflow, embedder, chunker, config);
        (dir, db, processor)
    }

    pub(crate) fn insert_pending_doc(db: &Database, title: &str, text: &str) -> Document {
        let doc = Document::new(title, text.to_string(), None, 3);
        db.insert_document(&doc).unwrap();
        doc
    }
}

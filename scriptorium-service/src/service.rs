//! Main service coordinator.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunking::TextChunker;
use crate::config::StaticConfig;
use crate::db::{Database, Document, EmbeddingStats, EmbeddingStatus};
use crate::embedding::OllamaClient;
use crate::error::{ServiceError, ServiceResult};
use crate::processor::{BatchEmbeddingProcessor, BreakerStatus};
use crate::workflow::WorkflowService;

pub struct ScriptoriumService {
    pub config: Arc<StaticConfig>,
    pub db: Arc<Database>,
    pub workflow: Arc<WorkflowService>,
    pub processor: Arc<BatchEmbeddingProcessor>,
    embedder: Arc<OllamaClient>,
}

impl ScriptoriumService {
    /// Create a new service instance over a pre-opened database.
    pub async fn new(db: Arc<Database>, config: Arc<StaticConfig>) -> ServiceResult<Self> {
        info!("Initializing scriptorium service");

        let embedder = Arc::new(OllamaClient::new(&config.embedding)?);
        if embedder.health_check().await {
            info!(url = %config.embedding.base_url, "embedding provider is available");
        } else {
            warn!(url = %config.embedding.base_url, "embedding provider is not available");
        }

        let chunker = Arc::new(TextChunker::new(&config.chunking));
        let workflow = Arc::new(WorkflowService::new(db.clone()));
        let processor = Arc::new(BatchEmbeddingProcessor::new(
            db.clone(),
            workflow.clone(),
            embedder.clone(),
            chunker,
            config.pipeline.clone(),
        ));

        Ok(Self {
            config,
            db,
            workflow,
            processor,
            embedder,
        })
    }

    /// Start the batch embedding worker. Called once on server startup.
    pub fn start_embedding_worker(
        service: Arc<ScriptoriumService>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        BatchEmbeddingProcessor::start(service.processor.clone(), shutdown)
    }

    /// Register a document with already-extracted text; the background
    /// pipeline picks it up on its next cycle.
    pub fn register_document(
        &self,
        title: &str,
        extracted_text: String,
        source_path: Option<String>,
    ) -> ServiceResult<Document> {
        if title.trim().is_empty() {
            return Err(ServiceError::InvalidRequest {
                message: "document title must not be empty".to_string(),
            });
        }

        let doc = Document::new(
            title,
            extracted_text,
            source_path,
            self.config.pipeline.default_max_retries,
        );
        self.db.insert_document(&doc)?;
        info!(doc_id = %doc.id, title = %doc.title, "document registered");
        Ok(doc)
    }

    /// Process one named document immediately.
    pub async fn process_document_now(&self, document_id: &str) -> ServiceResult<()> {
        self.processor
            .process_single_document(document_id, &CancellationToken::new())
            .await
    }

    /// Sweep all pending work immediately.
    pub async fn process_all_now(&self) -> ServiceResult<usize> {
        self.processor.run_sweep(&CancellationToken::new()).await
    }

    /// Manual restart of a completed, failed, permanently failed, or
    /// cancelled document: back to Extracting with a fresh retry budget, and
    /// back into the embedding pipeline.
    pub fn restart_document(&self, document_id: &str) -> ServiceResult<()> {
        self.workflow.restart(document_id)?;
        self.db
            .update_embedding_status(document_id, EmbeddingStatus::Pending)?;
        Ok(())
    }

    /// Embedding coverage statistics.
    pub fn stats(&self) -> ServiceResult<EmbeddingStats> {
        self.db.embedding_stats()
    }

    /// Circuit breaker state, for health reporting.
    pub fn breaker_status(&self) -> BreakerStatus {
        self.processor.breaker_status()
    }

    /// Whether the embedding provider currently answers.
    pub async fn provider_healthy(&self) -> bool {
        self.embedder.health_check().await
    }
}

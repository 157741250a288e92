//! Document chunk/embed pass: drive pending documents through document-level
//! embedding, chunk creation, and per-chunk embedding.

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::BatchEmbeddingProcessor;
use crate::db::{Document, EmbeddingStatus};
use crate::error::ServiceResult;

/// Documents discovered per cycle. Deliberately small and independent of the
/// configured batch size, to bound embedding-provider call volume per cycle.
const DOCUMENT_WINDOW: usize = 8;

/// Upper bound on the text sent for the document-level embedding.
const DOC_EMBED_MAX_CHARS: usize = 8000;

impl BatchEmbeddingProcessor {
    /// One cycle's worth of document discovery and embedding.
    pub(crate) async fn run_document_pass(
        &self,
        shutdown: &CancellationToken,
    ) -> ServiceResult<usize> {
        self.process_discovered(DOCUMENT_WINDOW, shutdown).await
    }

    /// Self-heal, discover up to `limit` documents, and drive each through
    /// the pipeline. One document's failure never aborts the batch.
    pub(crate) async fn process_discovered(
        &self,
        limit: usize,
        shutdown: &CancellationToken,
    ) -> ServiceResult<usize> {
        let healed = self.db.reclassify_empty_pending()?;
        if healed > 0 {
            info!(count = healed, "reclassified empty documents as not required");
        }

        let docs = self.db.documents_needing_embedding(limit)?;
        if docs.is_empty() {
            return Ok(0);
        }
        if self.config.verbose_logging {
            debug!(count = docs.len(), "documents discovered for embedding");
        }

        let mut processed = 0;
        for doc in docs {
            if shutdown.is_cancelled() {
                break;
            }
            let Some(_claim) = self.claim(&doc.id) else {
                continue;
            };
            // drive_document already recorded the failure and reset the
            // document; the batch moves on
            if self.drive_document(&doc, shutdown).await.is_ok() {
                processed += 1;
            }
        }

        counter!("pipeline_documents_processed_total").increment(processed as u64);
        Ok(processed)
    }

    /// Chunk and embed a single document.
    ///
    /// Resumable: chunks are only created when the document owns none, and
    /// only unembedded chunks are sent to the provider. The document is
    /// marked Processing before chunk embedding begins so an interruption
    /// leaves a recoverable signal, and Completed only once a fresh count
    /// shows every chunk embedded. Anything short of that leaves it
    /// Processing for the completion pass.
    pub(super) async fn process_one_document(
        &self,
        doc: &Document,
        shutdown: &CancellationToken,
    ) -> ServiceResult<()> {
        if doc.embedding_dim.is_none() {
            match self
                .embedder
                .generate_embedding(doc_embedding_snippet(&doc.extracted_text))
                .await?
            {
                Some(vector) => {
                    self.db.set_document_embedding(&doc.id, &vector)?;
                    if self.config.verbose_logging {
                        debug!(doc_id = %doc.id, dim = vector.len(), "document-level embedding stored");
                    }
                }
                None => {
                    warn!(doc_id = %doc.id, "provider returned no document-level embedding");
                }
            }
        }

        let mut chunk_count = self.db.chunk_count(&doc.id)?;
        if chunk_count == 0 {
            let chunks = self.chunker.chunk_document(doc)?;
            if chunks.is_empty() {
                self.db
                    .update_embedding_status(&doc.id, EmbeddingStatus::NotRequired)?;
                info!(doc_id = %doc.id, "document produced no chunks, marking not required");
                return Ok(());
            }
            self.db.insert_chunks(&chunks)?;
            chunk_count = chunks.len();
            info!(doc_id = %doc.id, chunks = chunk_count, "chunks created");
        } else if self.config.verbose_logging {
            debug!(doc_id = %doc.id, chunks = chunk_count, "chunks already exist, skipping chunking");
        }

        self.db
            .update_embedding_status(&doc.id, EmbeddingStatus::Processing)?;

        let pending = self.db.chunks_without_embeddings_for_document(&doc.id)?;
        if !pending.is_empty() {
            let outcomes = self.embed_chunk_batch(pending, shutdown).await;
            let embedded = self.collect_embedded(outcomes);
            if !embedded.is_empty() {
                counter!("pipeline_chunks_embedded_total").increment(embedded.len() as u64);
                self.db.record_chunk_embeddings(&embedded)?;
            }
        }

        // completion strictly from fresh counts, never from counters
        // accumulated above
        let total = self.db.chunk_count(&doc.id)?;
        let done = self.db.embedded_chunk_count(&doc.id)?;
        if total > 0 && done == total {
            self.db
                .update_embedding_status(&doc.id, EmbeddingStatus::Completed)?;
            info!(doc_id = %doc.id, chunks = total, "document embedding complete");
        } else {
            debug!(
                doc_id = %doc.id,
                embedded = done,
                total,
                "document left processing for the completion pass"
            );
        }

        Ok(())
    }
}

/// Truncate text for the document-level embedding, respecting char
/// boundaries.
fn doc_embedding_snippet(text: &str) -> &str {
    if text.len() <= DOC_EMBED_MAX_CHARS {
        return text;
    }
    let mut end = DOC_EMBED_MAX_CHARS;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_empty_text_is_reclassified_not_required() {
        let (_dir, db, processor) = build_processor(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_pending_doc(&db, "empty", "");
        processor.run_document_pass(&shutdown).await.unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::NotRequired);
        assert_eq!(db.chunk_count(&doc.id).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_chunks_marks_not_required() {
        let (_dir, db, processor) = build_processor(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(EmptyChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_pending_doc(&db, "doc", "text that chunks to nothing");
        processor.run_document_pass(&shutdown).await.unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::NotRequired);
    }

    #[tokio::test]
    async fn test_happy_path_embeds_document_and_chunks() {
        let embedder = Arc::new(MockEmbedder::new(4));
        let (_dir, db, processor) = build_processor(
            embedder.clone(),
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_pending_doc(&db, "doc", "alpha. beta. gamma.");
        processor.run_document_pass(&shutdown).await.unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::Completed);
        assert_eq!(doc.embedding_dim, Some(4));
        let chunks = db.chunks_for_document(&doc.id).unwrap();
        assert_eq!(chunks.len(), 3);
        for chunk in &chunks {
            assert!(chunk.embedding.is_some());
            assert_eq!(chunk.embedding_dim, Some(4));
        }
    }

    #[tokio::test]
    async fn test_partial_chunk_failure_leaves_document_processing() {
        // provider succeeds for two chunks, returns nothing for the third
        let embedder = Arc::new(MockEmbedder::new(4).null_for("C"));
        let (_dir, db, processor) = build_processor(
            embedder.clone(),
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_pending_doc(&db, "doc", "A. B. C.");
        processor.run_document_pass(&shutdown).await.unwrap();

        let fetched = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(fetched.embedding_status, EmbeddingStatus::Processing);
        let chunks = db.chunks_for_document(&doc.id).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[0].embedding.is_some());
        assert!(chunks[1].embedding.is_some());
        assert!(chunks[2].embedding.is_none());

        // once the provider recovers, the completion pass finishes the job
        embedder.clear_null();
        processor.run_chunk_completion_pass(&shutdown).await.unwrap();

        let fetched = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(fetched.embedding_status, EmbeddingStatus::Completed);
        let chunks = db.chunks_for_document(&doc.id).unwrap();
        assert!(chunks.iter().all(|c| c.embedding.is_some()));
    }

    #[tokio::test]
    async fn test_chunker_failure_resets_document_and_batch_continues() {
        let (_dir, db, failing) = build_processor(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(FailingChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let first = insert_pending_doc(&db, "first", "will fail.");
        let second = insert_pending_doc(&db, "second", "will also fail.");

        let processed = failing.run_document_pass(&shutdown).await.unwrap();
        assert_eq!(processed, 0);

        // both documents were attempted and reset, with the error recorded
        for doc in [&first, &second] {
            let fetched = db.get_document(&doc.id).unwrap().unwrap();
            assert_eq!(fetched.embedding_status, EmbeddingStatus::Pending);
            assert!(fetched.error_message.is_some());
            assert!(fetched.error_category.is_some());
            assert_eq!(db.chunk_count(&doc.id).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn test_processing_document_without_chunks_is_recovered() {
        let (_dir, db, processor) = build_processor(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        // simulate a crash that left the document mid-pipeline
        let doc = insert_pending_doc(&db, "doc", "alpha. beta.");
        db.update_embedding_status(&doc.id, EmbeddingStatus::Processing)
            .unwrap();

        processor.run_document_pass(&shutdown).await.unwrap();

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::Completed);
        assert_eq!(db.chunk_count(&doc.id).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_completed_document_is_not_reprocessed() {
        let embedder = Arc::new(MockEmbedder::new(4));
        let (_dir, db, processor) = build_processor(
            embedder.clone(),
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_pending_doc(&db, "doc", "alpha. beta.");
        processor.run_document_pass(&shutdown).await.unwrap();
        let after_first = db.chunks_for_document(&doc.id).unwrap();
        let calls_after_first = embedder.call_count();

        processor.run_document_pass(&shutdown).await.unwrap();

        // no duplicate chunks, no further provider calls, embeddings intact
        let after_second = db.chunks_for_document(&doc.id).unwrap();
        assert_eq!(after_second.len(), after_first.len());
        assert_eq!(embedder.call_count(), calls_after_first);
        for (a, b) in after_first.iter().zip(after_second.iter()) {
            assert_eq!(a.id, b.id);
            assert_eq!(a.embedding, b.embedding);
        }
    }

    #[test]
    fn test_doc_embedding_snippet_respects_char_boundaries() {
        let text = "é".repeat(DOC_EMBED_MAX_CHARS);
        let snippet = doc_embedding_snippet(&text);
        assert!(snippet.len() <= DOC_EMBED_MAX_CHARS);
        assert!(text.is_char_boundary(snippet.len()));
        assert_eq!(doc_embedding_snippet("short"), "short");
    }
}

//! Chunk embed-completion pass: close the gap for chunks that exist but
//! still lack an embedding, and complete the documents they belong to.

use std::collections::BTreeSet;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::BatchEmbeddingProcessor;
use crate::db::EmbeddingStatus;
use crate::error::ServiceResult;

/// Unembedded chunks attempted per cycle.
const CHUNK_WINDOW: usize = 64;

impl BatchEmbeddingProcessor {
    /// Embed up to a window of outstanding chunks, in-flight documents
    /// first, then mark any document that reached full coverage Completed.
    ///
    /// All chunk writes happen in one batched write and all document
    /// completions in a second; completion is re-derived from fresh counts
    /// at decision time.
    pub(crate) async fn run_chunk_completion_pass(
        &self,
        shutdown: &CancellationToken,
    ) -> ServiceResult<usize> {
        let pending = self.db.chunks_without_embeddings(CHUNK_WINDOW)?;
        if pending.is_empty() {
            return Ok(0);
        }
        if self.config.verbose_logging {
            debug!(count = pending.len(), "chunks discovered for embedding completion");
        }

        let touched: BTreeSet<String> = pending.iter().map(|c| c.document_id.clone()).collect();

        let outcomes = self.embed_chunk_batch(pending, shutdown).await;
        let embedded = self.collect_embedded(outcomes);
        let embedded_count = embedded.len();

        if !embedded.is_empty() {
            counter!("pipeline_chunks_embedded_total").increment(embedded_count as u64);
            self.db.record_chunk_embeddings(&embedded)?;
        }

        let mut completed: Vec<String> = Vec::new();
        for document_id in touched {
            let Some(doc) = self.db.get_document(&document_id)? else {
                continue;
            };
            if doc.embedding_status != EmbeddingStatus::Processing {
                continue;
            }
            let total = self.db.chunk_count(&document_id)?;
            let done = self.db.embedded_chunk_count(&document_id)?;
            if total > 0 && done == total {
                completed.push(document_id);
            }
        }

        if !completed.is_empty() {
            self.db.mark_documents_completed(&completed)?;
            info!(count = completed.len(), "documents completed by the embedding pass");
        }

        Ok(embedded_count)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::db::{Chunk, ChunkKind, Document};
    use chrono::Utc;
    use std::sync::Arc;

    fn insert_doc_with_chunks(
        db: &crate::db::Database,
        title: &str,
        status: EmbeddingStatus,
        contents: &[&str],
    ) -> Document {
        let doc = Document::new(title, contents.join(" "), None, 3);
        db.insert_document(&doc).unwrap();
        db.update_embedding_status(&doc.id, status).unwrap();
        let chunks: Vec<Chunk> = contents
            .iter()
            .enumerate()
            .map(|(i, content)| Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                chunk_index: i as i64,
                content: content.to_string(),
                title: None,
                section: None,
                keywords: Vec::new(),
                importance: 0.5,
                kind: ChunkKind::Paragraph,
                embedding: None,
                embedding_dim: None,
                created_at: Utc::now(),
            })
            .collect();
        db.insert_chunks(&chunks).unwrap();
        doc
    }

    #[tokio::test]
    async fn test_completion_marks_fully_embedded_documents() {
        let (_dir, db, processor) = build_processor(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_doc_with_chunks(
            &db,
            "doc",
            EmbeddingStatus::Processing,
            &["alpha", "beta", "gamma"],
        );

        let embedded = processor.run_chunk_completion_pass(&shutdown).await.unwrap();
        assert_eq!(embedded, 3);

        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::Completed);
    }

    #[tokio::test]
    async fn test_single_chunk_failure_does_not_abort_batch() {
        let embedder = Arc::new(MockEmbedder::new(4).null_for("beta"));
        let (_dir, db, processor) = build_processor(
            embedder,
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_doc_with_chunks(
            &db,
            "doc",
            EmbeddingStatus::Processing,
            &["alpha", "beta", "gamma"],
        );

        let embedded = processor.run_chunk_completion_pass(&shutdown).await.unwrap();
        assert_eq!(embedded, 2);

        // the document stays processing until every chunk is covered
        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::Processing);
        let chunks = db.chunks_for_document(&doc.id).unwrap();
        assert!(chunks[0].embedding.is_some());
        assert!(chunks[1].embedding.is_none());
        assert!(chunks[2].embedding.is_some());
    }

    #[tokio::test]
    async fn test_processing_documents_take_priority_over_pending() {
        let (_dir, db, processor) = build_processor(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(SentenceChunker),
            test_config(),
        );

        // pending document inserted first so creation order cannot mask
        // priority ordering
        let pending_doc =
            insert_doc_with_chunks(&db, "pending", EmbeddingStatus::Pending, &["one"]);
        let processing_doc =
            insert_doc_with_chunks(&db, "processing", EmbeddingStatus::Processing, &["two"]);

        let selected = db.chunks_without_embeddings(1).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].document_id, processing_doc.id);

        // and the full pass completes the in-flight document
        let shutdown = CancellationToken::new();
        processor.run_chunk_completion_pass(&shutdown).await.unwrap();
        let processing_doc = db.get_document(&processing_doc.id).unwrap().unwrap();
        assert_eq!(processing_doc.embedding_status, EmbeddingStatus::Completed);
        // the pending document is left for the document pass to claim
        let pending_doc = db.get_document(&pending_doc.id).unwrap().unwrap();
        assert_eq!(pending_doc.embedding_status, EmbeddingStatus::Pending);
    }

    #[tokio::test]
    async fn test_pending_documents_are_not_marked_completed_here() {
        let (_dir, db, processor) = build_processor(
            Arc::new(MockEmbedder::new(4)),
            Arc::new(SentenceChunker),
            test_config(),
        );
        let shutdown = CancellationToken::new();

        let doc = insert_doc_with_chunks(&db, "doc", EmbeddingStatus::Pending, &["alpha"]);
        processor.run_chunk_completion_pass(&shutdown).await.unwrap();

        // chunks embedded, but status transitions stay owned by the document
        // pass for documents that never reached Processing
        let doc = db.get_document(&doc.id).unwrap().unwrap();
        assert_eq!(doc.embedding_status, EmbeddingStatus::Pending);
        let chunks = db.chunks_for_document(&doc.id).unwrap();
        assert!(chunks[0].embedding.is_some());
    }
}

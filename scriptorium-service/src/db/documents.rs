//! Document CRUD, discovery queries, and workflow field updates.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};

use super::Database;
use super::models::{Document, EmbeddingStats, EmbeddingStatus};
use crate::error::{DatabaseError, ServiceResult};
use crate::workflow::DocumentState;

/// Column list shared by every document SELECT; order matches
/// `Document::from_row`.
pub(super) const DOCUMENT_COLUMNS: &str = "id, title, source_path, extracted_text, \
     embedding_status, embedding, embedding_dim, workflow_state, previous_state, \
     state_entered_at, error_category, error_message, error_detail, error_retryable, \
     retry_count, max_retries, last_retry_at, next_retry_at, created_at, updated_at";

impl Database {
    /// Insert a new document
    pub fn insert_document(&self, doc: &Document) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let error_detail_json = doc
            .error_detail
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        conn.execute(
            r#"
            INSERT INTO documents (id, title, source_path, extracted_text,
                embedding_status, embedding, embedding_dim, workflow_state, previous_state,
                state_entered_at, error_category, error_message, error_detail, error_retryable,
                retry_count, max_retries, last_retry_at, next_retry_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            "#,
            params![
                doc.id,
                doc.title,
                doc.source_path,
                doc.extracted_text,
                doc.embedding_status.as_str(),
                doc.embedding.as_deref().map(super::embedding_to_blob),
                doc.embedding_dim.map(|d| d as i64),
                doc.workflow_state.to_string(),
                doc.previous_state.map(|s| s.to_string()),
                doc.state_entered_at.to_rfc3339(),
                doc.error_category,
                doc.error_message,
                error_detail_json,
                doc.error_retryable,
                doc.retry_count as i64,
                doc.max_retries as i64,
                doc.last_retry_at.map(|t| t.to_rfc3339()),
                doc.next_retry_at.map(|t| t.to_rfc3339()),
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Get a document by ID
    pub fn get_document(&self, id: &str) -> ServiceResult<Option<Document>> {
        let conn = self.conn.lock().unwrap();

        conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"),
            params![id],
            Document::from_row,
        )
        .optional()
        .map_err(DatabaseError::Query)
        .map_err(Into::into)
    }

    /// List all documents, most recently created first
    pub fn list_documents(&self) -> ServiceResult<Vec<Document>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_at DESC"
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map([], Document::from_row)
            .map_err(DatabaseError::Query)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(DatabaseError::Query)?);
        }
        Ok(docs)
    }

    /// Update a document's embedding-pipeline status
    pub fn update_embedding_status(
        &self,
        document_id: &str,
        status: EmbeddingStatus,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE documents SET embedding_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), document_id],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Store a document-level embedding.
    ///
    /// Rejects a vector whose dimension conflicts with one already recorded
    /// on the document.
    pub fn set_document_embedding(
        &self,
        document_id: &str,
        embedding: &[f32],
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let stored: Option<i64> = conn
            .query_row(
                "SELECT embedding_dim FROM documents WHERE id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;

        if let Some(stored) = stored
            && stored as usize != embedding.len()
        {
            return Err(DatabaseError::DimensionMismatch {
                entity: format!("document {document_id}"),
                stored: stored as usize,
                attempted: embedding.len(),
            }
            .into());
        }

        conn.execute(
            "UPDATE documents SET embedding = ?1, embedding_dim = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                super::embedding_to_blob(embedding),
                embedding.len() as i64,
                Utc::now().to_rfc3339(),
                document_id,
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Self-healing: Pending documents with no extracted text can never be
    /// embedded; reclassify them in one sweep. Returns the number healed.
    pub fn reclassify_empty_pending(&self) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();

        let rows = conn
            .execute(
                "UPDATE documents SET embedding_status = 'not_required', updated_at = ?1
                 WHERE embedding_status = 'pending' AND trim(extracted_text) = ''",
                params![Utc::now().to_rfc3339()],
            )
            .map_err(DatabaseError::Query)?;

        Ok(rows)
    }

    /// Discover documents needing the chunk/embed pass: Pending with text, or
    /// Processing with zero chunks (left mid-pipeline by a previous run).
    pub fn documents_needing_embedding(&self, limit: usize) -> ServiceResult<Vec<Document>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                r#"
                SELECT {DOCUMENT_COLUMNS} FROM documents d
                WHERE (d.embedding_status = 'pending' AND trim(d.extracted_text) != '')
                   OR (d.embedding_status = 'processing'
                       AND NOT EXISTS (SELECT 1 FROM chunks c WHERE c.document_id = d.id))
                ORDER BY d.created_at
                LIMIT ?1
                "#
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![limit as i64], Document::from_row)
            .map_err(DatabaseError::Query)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(DatabaseError::Query)?);
        }
        Ok(docs)
    }

    /// Documents whose scheduled retry time has arrived, oldest first.
    ///
    /// Only states that legally accept a transition to Retrying are
    /// considered.
    pub fn documents_ready_for_retry(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> ServiceResult<Vec<Document>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                r#"
                SELECT {DOCUMENT_COLUMNS} FROM documents
                WHERE next_retry_at IS NOT NULL
                  AND next_retry_at <= ?1
                  AND error_retryable = 1
                  AND workflow_state IN
                      ('failed', 'extracting', 'analyzing', 'chunking', 'embedding', 'indexing')
                ORDER BY next_retry_at
                LIMIT ?2
                "#
            ))
            .map_err(DatabaseError::Query)?;

        let rows = stmt
            .query_map(params![now.to_rfc3339(), limit as i64], Document::from_row)
            .map_err(DatabaseError::Query)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row.map_err(DatabaseError::Query)?);
        }
        Ok(docs)
    }

    /// Persist a workflow state change.
    pub fn update_workflow_state(
        &self,
        document_id: &str,
        state: DocumentState,
        previous_state: Option<DocumentState>,
        entered_at: DateTime<Utc>,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE documents SET workflow_state = ?1, previous_state = ?2,
                 state_entered_at = ?3, updated_at = ?3 WHERE id = ?4",
            params![
                state.to_string(),
                previous_state.map(|s| s.to_string()),
                entered_at.to_rfc3339(),
                document_id,
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Persist retry bookkeeping after an attempt is counted.
    pub fn update_retry_bookkeeping(
        &self,
        document_id: &str,
        retry_count: u32,
        last_retry_at: Option<DateTime<Utc>>,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        conn.execute(
            "UPDATE documents SET retry_count = ?1, last_retry_at = ?2,
                 next_retry_at = ?3, updated_at = ?4 WHERE id = ?5",
            params![
                retry_count as i64,
                last_retry_at.map(|t| t.to_rfc3339()),
                next_retry_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
                document_id,
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Persist the error fields recorded for a failed document.
    pub fn update_error_fields(
        &self,
        document_id: &str,
        category: &str,
        message: &str,
        detail: Option<&serde_json::Value>,
        retryable: bool,
    ) -> ServiceResult<()> {
        let conn = self.conn.lock().unwrap();

        let detail_json = detail
            .map(serde_json::to_string)
            .transpose()
            .map_err(DatabaseError::Serialization)?;

        conn.execute(
            "UPDATE documents SET error_category = ?1, error_message = ?2,
                 error_detail = ?3, error_retryable = ?4, updated_at = ?5 WHERE id = ?6",
            params![
                category,
                message,
                detail_json,
                retryable,
                Utc::now().to_rfc3339(),
                document_id,
            ],
        )
        .map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Mark a batch of documents Completed in a single transaction.
    pub fn mark_documents_completed(&self, document_ids: &[String]) -> ServiceResult<()> {
        let mut conn = self.conn.lock().unwrap();

        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        {
            let mut stmt = tx
                .prepare(
                    "UPDATE documents SET embedding_status = 'completed', updated_at = ?1
                     WHERE id = ?2",
                )
                .map_err(DatabaseError::Query)?;
            let now = Utc::now().to_rfc3339();
            for id in document_ids {
                stmt.execute(params![now, id]).map_err(DatabaseError::Query)?;
            }
        }
        tx.commit().map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Embedding coverage statistics, computed fresh from the store.
    pub fn embedding_stats(&self) -> ServiceResult<EmbeddingStats> {
        let conn = self.conn.lock().unwrap();

        let (total_documents, documents_without_embedding): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), SUM(CASE WHEN embedding IS NULL THEN 1 ELSE 0 END)
                 FROM documents",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    ))
                },
            )
            .map_err(DatabaseError::Query)?;

        let (total_chunks, chunks_without_embedding): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), SUM(CASE WHEN embedding IS NULL THEN 1 ELSE 0 END)
                 FROM chunks",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    ))
                },
            )
            .map_err(DatabaseError::Query)?;

        let embedded = total_chunks - chunks_without_embedding;
        let coverage = if total_chunks > 0 {
            embedded as f64 * 100.0 / total_chunks as f64
        } else {
            0.0
        };

        Ok(EmbeddingStats {
            total_documents: total_documents as usize,
            documents_without_embedding: documents_without_embedding as usize,
            total_chunks: total_chunks as usize,
            chunks_without_embedding: chunks_without_embedding as usize,
            embedding_coverage_percent: coverage,
        })
    }
}

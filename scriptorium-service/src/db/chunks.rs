//! Chunk CRUD and embedding persistence.

use rusqlite::params;

use super::Database;
use super::models::Chunk;
use crate::error::{DatabaseError, ServiceResult};

/// Column list shared by every chunk SELECT; order matches `Chunk::from_row`.
pub(super) const CHUNK_COLUMNS: &str = "id, document_id, chunk_index, content, title, \
     section, keywords, importance, kind, embedding, embedding_dim, created_at";

impl Database {
    /// Insert a document's chunks in a single transaction.
    pub fn insert_chunks(&self, chunks: &[Chunk]) -> ServiceResult<()> {
        let mut conn = self.conn.lock().unwrap();

        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        {
            let mut stmt = tx
                .prepare(
                    r#"
                    INSERT INTO chunks (id, document_id, chunk_index, content, title, section,
                        keywords, importance, kind, embedding, embedding_dim, created_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    "#,
                )
                .map_err(DatabaseError::Query)?;

            for chunk in chunks {
                let keywords_json = serde_json::to_string(&chunk.keywords)
                    .map_err(DatabaseError::Serialization)?;
                stmt.execute(params![
                    chunk.id,
                    chunk.document_id,
                    chunk.chunk_index,
                    chunk.content,
                    chunk.title,
                    chunk.section,
                    keywords_json,
                    chunk.importance,
                    chunk.kind.to_string(),
                    chunk.embedding.as_deref().map(super::embedding_to_blob),
                    chunk.embedding_dim.map(|d| d as i64),
                    chunk.created_at.to_rfc3339(),
                ])
                .map_err(DatabaseError::Query)?;
            }
        }
        tx.commit().map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// All chunks of a document, in ordinal order.
    pub fn chunks_for_document(&self, document_id: &str) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ?1 ORDER BY chunk_index"
            ))
            .map_err(DatabaseError::Query)?;

        let chunks: Vec<Chunk> = stmt
            .query_map(params![document_id], Chunk::from_row)
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Chunks of one document that still lack an embedding, in ordinal order.
    pub fn chunks_without_embeddings_for_document(
        &self,
        document_id: &str,
    ) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(&format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks
                 WHERE document_id = ?1 AND embedding IS NULL
                 ORDER BY chunk_index"
            ))
            .map_err(DatabaseError::Query)?;

        let chunks: Vec<Chunk> = stmt
            .query_map(params![document_id], Chunk::from_row)
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Unembedded chunks across all documents, at most `limit`.
    ///
    /// Chunks of documents currently Processing come before chunks of Pending
    /// documents, so in-flight documents finish first.
    pub fn chunks_without_embeddings(&self, limit: usize) -> ServiceResult<Vec<Chunk>> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(
                r#"
                SELECT c.id, c.document_id, c.chunk_index, c.content, c.title, c.section,
                       c.keywords, c.importance, c.kind, c.embedding, c.embedding_dim,
                       c.created_at
                FROM chunks c
                JOIN documents d ON d.id = c.document_id
                WHERE c.embedding IS NULL
                ORDER BY CASE d.embedding_status
                             WHEN 'processing' THEN 0
                             WHEN 'pending' THEN 1
                             ELSE 2
                         END,
                         c.document_id, c.chunk_index
                LIMIT ?1
                "#,
            )
            .map_err(DatabaseError::Query)?;

        let chunks: Vec<Chunk> = stmt
            .query_map(params![limit as i64], Chunk::from_row)
            .map_err(DatabaseError::Query)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(chunks)
    }

    /// Record a batch of chunk embeddings in a single transaction.
    ///
    /// Each write checks the chunk's recorded dimension first; a conflicting
    /// dimension aborts the batch with a dimension-mismatch error rather than
    /// silently overwriting.
    pub fn record_chunk_embeddings(&self, embeddings: &[(String, Vec<f32>)]) -> ServiceResult<()> {
        let mut conn = self.conn.lock().unwrap();

        let tx = conn.transaction().map_err(DatabaseError::Query)?;
        {
            let mut dim_stmt = tx
                .prepare("SELECT embedding_dim FROM chunks WHERE id = ?1")
                .map_err(DatabaseError::Query)?;
            let mut update_stmt = tx
                .prepare(
                    "UPDATE chunks SET embedding = ?1, embedding_dim = ?2 WHERE id = ?3",
                )
                .map_err(DatabaseError::Query)?;

            for (chunk_id, embedding) in embeddings {
                let stored: Option<i64> = dim_stmt
                    .query_row(params![chunk_id], |row| row.get(0))
                    .map_err(DatabaseError::Query)?;

                if let Some(stored) = stored
                    && stored as usize != embedding.len()
                {
                    return Err(DatabaseError::DimensionMismatch {
                        entity: format!("chunk {chunk_id}"),
                        stored: stored as usize,
                        attempted: embedding.len(),
                    }
                    .into());
                }

                update_stmt
                    .execute(params![
                        super::embedding_to_blob(embedding),
                        embedding.len() as i64,
                        chunk_id,
                    ])
                    .map_err(DatabaseError::Query)?;
            }
        }
        tx.commit().map_err(DatabaseError::Query)?;

        Ok(())
    }

    /// Count of chunks for a document.
    pub fn chunk_count(&self, document_id: &str) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;
        Ok(count as usize)
    }

    /// Count of chunks for a document that carry an embedding.
    pub fn embedded_chunk_count(&self, document_id: &str) -> ServiceResult<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM chunks WHERE document_id = ?1 AND embedding IS NOT NULL",
                params![document_id],
                |row| row.get(0),
            )
            .map_err(DatabaseError::Query)?;
        Ok(count as usize)
    }
}

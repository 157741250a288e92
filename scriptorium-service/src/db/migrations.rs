//! Database schema migrations.

use rusqlite::Connection;

use crate::error::{DatabaseError, ServiceResult};

/// Run all database migrations.
///
/// Called during database initialization to ensure the schema is up to date.
pub(super) fn run_migrations(conn: &Connection) -> ServiceResult<()> {
    conn.execute_batch(
        r#"
        -- Documents table
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            source_path TEXT,
            extracted_text TEXT NOT NULL DEFAULT '',
            embedding_status TEXT NOT NULL DEFAULT 'pending',
            embedding BLOB,
            embedding_dim INTEGER,
            workflow_state TEXT NOT NULL DEFAULT 'queued',
            previous_state TEXT,
            state_entered_at TEXT NOT NULL DEFAULT (datetime('now')),
            error_category TEXT,
            error_message TEXT,
            error_detail TEXT,
            error_retryable INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_retry_at TEXT,
            next_retry_at TEXT,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_documents_embedding_status
            ON documents(embedding_status);
        CREATE INDEX IF NOT EXISTS idx_documents_workflow_state
            ON documents(workflow_state);
        CREATE INDEX IF NOT EXISTS idx_documents_next_retry
            ON documents(next_retry_at) WHERE next_retry_at IS NOT NULL;

        -- Chunks table
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            title TEXT,
            section TEXT,
            keywords TEXT,
            importance REAL NOT NULL DEFAULT 0.0,
            kind TEXT NOT NULL DEFAULT 'paragraph',
            embedding BLOB,
            embedding_dim INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE (document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
        CREATE INDEX IF NOT EXISTS idx_chunks_unembedded
            ON chunks(document_id) WHERE embedding IS NULL;
        "#,
    )
    .map_err(|e| DatabaseError::Migration {
        message: e.to_string(),
    })?;

    Ok(())
}

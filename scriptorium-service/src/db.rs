//! Database module for SQLite operations.
//!
//! Provides the `Database` struct and all database operations organized into
//! submodules by domain.

mod chunks;
mod documents;
mod migrations;
pub mod models;

pub use models::{Chunk, ChunkKind, Document, EmbeddingStats, EmbeddingStatus};

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{DatabaseError, ServiceError, ServiceResult};

/// Database manager for SQLite operations
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: &Path) -> ServiceResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ServiceError::Database(DatabaseError::Connection(
                    rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
                ))
            })?;
        }

        let conn = Connection::open(path).map_err(DatabaseError::Connection)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(DatabaseError::Query)?;

        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

/// Encode an f32 vector as a little-endian byte blob.
pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Decode a little-endian byte blob back into an f32 vector.
pub(crate) fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        .collect()
}

#[cfg(test)]
impl Database {
    /// Simulate a broken store by renaming the documents table away.
    pub(crate) fn break_for_tests(&self) {
        self.conn
            .lock()
            .unwrap()
            .execute_batch("ALTER TABLE documents RENAME TO documents_broken;")
            .unwrap();
    }

    /// Undo `break_for_tests`.
    pub(crate) fn repair_for_tests(&self) {
        self.conn
            .lock()
            .unwrap()
            .execute_batch("ALTER TABLE documents_broken RENAME TO documents;")
            .unwrap();
    }
}

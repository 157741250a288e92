//! Database model structs.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::workflow::DocumentState;

/// Coarse status of the chunk/embedding sub-phase of a document.
///
/// Tracked alongside the fine-grained workflow state: the batch embedding
/// passes discover and complete work purely through this field.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    /// Waiting for chunking/embedding
    Pending,
    /// Chunks exist, embeddings in flight
    Processing,
    /// Every chunk carries an embedding
    Completed,
    /// No embeddable text (or chunking produced nothing)
    NotRequired,
}

impl EmbeddingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingStatus::Pending => "pending",
            EmbeddingStatus::Processing => "processing",
            EmbeddingStatus::Completed => "completed",
            EmbeddingStatus::NotRequired => "not_required",
        }
    }

    pub fn parse_or_pending(s: &str) -> Self {
        s.parse().unwrap_or(EmbeddingStatus::Pending)
    }
}

/// Semantic classification of a chunk, produced by the chunking provider.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Heading,
    #[default]
    Paragraph,
    List,
    Table,
    Other,
}

/// Document record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub source_path: Option<String>,
    /// Extracted text; may legitimately be empty.
    #[serde(default)]
    pub extracted_text: String,
    pub embedding_status: EmbeddingStatus,
    /// Document-level embedding; never serialized to API consumers.
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub embedding_dim: Option<usize>,
    pub workflow_state: DocumentState,
    /// State held immediately before entering Retrying.
    pub previous_state: Option<DocumentState>,
    pub state_entered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<serde_json::Value>,
    pub error_retryable: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Build a freshly registered document: queued, pending, no retries yet.
    pub fn new(
        title: impl Into<String>,
        extracted_text: String,
        source_path: Option<String>,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            source_path,
            extracted_text,
            embedding_status: EmbeddingStatus::Pending,
            embedding: None,
            embedding_dim: None,
            workflow_state: DocumentState::Queued,
            previous_state: None,
            state_entered_at: now,
            error_category: None,
            error_message: None,
            error_detail: None,
            error_retryable: false,
            retry_count: 0,
            max_retries,
            last_retry_at: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Column order matches `db::documents::DOCUMENT_COLUMNS`.
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let embedding_blob: Option<Vec<u8>> = row.get(5)?;
        let embedding_dim: Option<i64> = row.get(6)?;
        let status_str: String = row.get(4)?;
        let state_str: String = row.get(7)?;
        let previous_state_str: Option<String> = row.get(8)?;
        let state_entered_at_str: String = row.get(9)?;
        let error_category: Option<String> = row.get(10)?;
        let error_message: Option<String> = row.get(11)?;
        let error_detail_str: Option<String> = row.get(12)?;
        let error_retryable: bool = row.get(13)?;
        let retry_count: i64 = row.get(14)?;
        let max_retries: i64 = row.get(15)?;
        let last_retry_at_str: Option<String> = row.get(16)?;
        let next_retry_at_str: Option<String> = row.get(17)?;
        let created_at_str: String = row.get(18)?;
        let updated_at_str: String = row.get(19)?;

        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            source_path: row.get(2)?,
            extracted_text: row.get(3)?,
            embedding_status: EmbeddingStatus::parse_or_pending(&status_str),
            embedding: embedding_blob.as_deref().map(super::blob_to_embedding),
            embedding_dim: embedding_dim.map(|d| d as usize),
            workflow_state: state_str.parse().unwrap_or(DocumentState::Queued),
            previous_state: previous_state_str.and_then(|s| s.parse().ok()),
            state_entered_at: parse_timestamp(&state_entered_at_str),
            error_category,
            error_message,
            error_detail: error_detail_str.and_then(|s| serde_json::from_str(&s).ok()),
            error_retryable,
            retry_count: retry_count as u32,
            max_retries: max_retries as u32,
            last_retry_at: last_retry_at_str.as_deref().map(parse_timestamp),
            next_retry_at: next_retry_at_str.as_deref().map(parse_timestamp),
            created_at: parse_timestamp(&created_at_str),
            updated_at: parse_timestamp(&updated_at_str),
        })
    }

}

/// Chunk record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub keywords: Vec<String>,
    pub importance: f32,
    pub kind: ChunkKind,
    #[serde(skip_serializing)]
    pub embedding: Option<Vec<f32>>,
    pub embedding_dim: Option<usize>,
    pub created_at: DateTime<Utc>,
}

impl Chunk {
    /// Column order matches `db::chunks::CHUNK_COLUMNS`.
    pub(crate) fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let keywords_str: Option<String> = row.get(6)?;
        let kind_str: String = row.get(8)?;
        let embedding_blob: Option<Vec<u8>> = row.get(9)?;
        let embedding_dim: Option<i64> = row.get(10)?;
        let created_at_str: String = row.get(11)?;

        Ok(Self {
            id: row.get(0)?,
            document_id: row.get(1)?,
            chunk_index: row.get(2)?,
            content: row.get(3)?,
            title: row.get(4)?,
            section: row.get(5)?,
            keywords: keywords_str
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or_default(),
            importance: row.get(7)?,
            kind: kind_str.parse().unwrap_or_default(),
            embedding: embedding_blob.as_deref().map(super::blob_to_embedding),
            embedding_dim: embedding_dim.map(|d| d as usize),
            created_at: parse_timestamp(&created_at_str),
        })
    }
}

/// Read-only embedding coverage statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingStats {
    pub total_documents: usize,
    pub documents_without_embedding: usize,
    pub total_chunks: usize,
    pub chunks_without_embedding: usize,
    pub embedding_coverage_percent: f64,
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

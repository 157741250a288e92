use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Main service error type
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Document not found: {document_id}")]
    DocumentNotFound { document_id: String },

    #[error("Database error")]
    Database(#[from] DatabaseError),

    #[error("Embedding provider error")]
    Embedding(#[from] EmbeddingError),

    #[error("Workflow error")]
    Workflow(#[from] WorkflowError),

    #[error("Chunking failed")]
    Chunking(#[from] ChunkingError),

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

/// Database errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed")]
    Connection(#[source] rusqlite::Error),

    #[error("Query failed")]
    Query(#[source] rusqlite::Error),

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed")]
    Serialization(#[source] serde_json::Error),

    #[error(
        "Embedding dimension mismatch for {entity}: stored dimension {stored}, attempted write of dimension {attempted}"
    )]
    DimensionMismatch {
        entity: String,
        stored: usize,
        attempted: usize,
    },
}

/// Embedding provider errors
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Connection failed to embedding provider at {url}")]
    Connection {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Embedding model not found: {model}")]
    ModelNotFound { model: String },

    #[error("Embedding provider rate limited (status {status}): {message}")]
    RateLimited { status: u16, message: String },

    #[error("Embedding generation failed (status {status}): {message}")]
    Generation { status: u16, message: String },

    #[error("Invalid response from embedding provider: {message}")]
    InvalidResponse { message: String },
}

/// Workflow state machine errors
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Invalid state transition for document {document_id}: {from} -> {to}")]
    InvalidTransition {
        document_id: String,
        from: String,
        to: String,
    },

    #[error("Unknown workflow state: {value}")]
    UnknownState { value: String },
}

/// Chunking provider errors
#[derive(Error, Debug)]
pub enum ChunkingError {
    #[error("Document text too large to chunk: {chars} chars (max {max})")]
    OversizeInput { chars: usize, max: usize },
}

/// Error categories recorded alongside document failures.
///
/// The category decides retryability and is persisted as a string in the
/// document error fields for diagnostics.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display, strum::EnumString, strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidFormat,
    TextExtraction,
    EmbeddingProvider,
    Persistence,
    Network,
    OversizeInput,
    QuotaExceeded,
    PermissionDenied,
    Unknown,
}

impl ErrorCategory {
    /// Derive a category from a service error chain.
    pub fn from_error(error: &ServiceError) -> Self {
        match error {
            ServiceError::Database(_) => ErrorCategory::Persistence,
            ServiceError::Embedding(EmbeddingError::Connection { .. }) => ErrorCategory::Network,
            ServiceError::Embedding(EmbeddingError::RateLimited { .. }) => {
                ErrorCategory::QuotaExceeded
            }
            ServiceError::Embedding(_) => ErrorCategory::EmbeddingProvider,
            ServiceError::Chunking(ChunkingError::OversizeInput { .. }) => {
                ErrorCategory::OversizeInput
            }
            ServiceError::Workflow(_) => ErrorCategory::Unknown,
            ServiceError::DocumentNotFound { .. }
            | ServiceError::InvalidRequest { .. }
            | ServiceError::Config { .. } => ErrorCategory::Unknown,
        }
    }

    /// Whether a failure in this category is worth retrying.
    ///
    /// Transient infrastructure trouble is retryable; malformed or oversized
    /// input will not get better on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorCategory::EmbeddingProvider
            | ErrorCategory::Persistence
            | ErrorCategory::Network
            | ErrorCategory::QuotaExceeded
            | ErrorCategory::Unknown => true,
            ErrorCategory::InvalidFormat
            | ErrorCategory::TextExtraction
            | ErrorCategory::OversizeInput
            | ErrorCategory::PermissionDenied => false,
        }
    }
}

/// Format an error with its full source chain, innermost last.
pub fn format_error_chain(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

/// API error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ServiceError {
    fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ServiceError::Embedding(EmbeddingError::ModelNotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Workflow(WorkflowError::InvalidTransition { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ServiceError::DocumentNotFound { .. } => "document_not_found",
            ServiceError::Database(DatabaseError::DimensionMismatch { .. }) => {
                "embedding_dimension_mismatch"
            }
            ServiceError::Database(_) => "database_error",
            ServiceError::Embedding(EmbeddingError::Connection { .. }) => {
                "embedding_provider_connection"
            }
            ServiceError::Embedding(EmbeddingError::ModelNotFound { .. }) => {
                "embedding_model_not_found"
            }
            ServiceError::Embedding(EmbeddingError::RateLimited { .. }) => {
                "embedding_provider_rate_limited"
            }
            ServiceError::Embedding(_) => "embedding_error",
            ServiceError::Workflow(WorkflowError::InvalidTransition { .. }) => "invalid_transition",
            ServiceError::Workflow(_) => "workflow_error",
            ServiceError::Chunking(_) => "chunking_error",
            ServiceError::InvalidRequest { .. } => "invalid_request",
            ServiceError::Config { .. } => "config_error",
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();

        let response = ErrorResponse {
            message: format_error_chain(&self),
            code: Some(code),
        };

        (status, Json(response)).into_response()
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_category_string_round_trip() {
        for category in ErrorCategory::iter() {
            let s = category.to_string();
            let parsed: ErrorCategory = s.parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert_eq!(ErrorCategory::QuotaExceeded.to_string(), "quota_exceeded");
    }

    #[test]
    fn test_retryability_split() {
        assert!(ErrorCategory::EmbeddingProvider.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::QuotaExceeded.is_retryable());
        assert!(!ErrorCategory::InvalidFormat.is_retryable());
        assert!(!ErrorCategory::OversizeInput.is_retryable());
        assert!(!ErrorCategory::PermissionDenied.is_retryable());
    }

    #[test]
    fn test_category_from_error() {
        let err = ServiceError::Embedding(EmbeddingError::RateLimited {
            status: 429,
            message: "slow down".to_string(),
        });
        assert_eq!(ErrorCategory::from_error(&err), ErrorCategory::QuotaExceeded);

        let err = ServiceError::Chunking(ChunkingError::OversizeInput {
            chars: 10,
            max: 5,
        });
        assert_eq!(ErrorCategory::from_error(&err), ErrorCategory::OversizeInput);

        let err = ServiceError::Database(DatabaseError::DimensionMismatch {
            entity: "chunk abc".to_string(),
            stored: 768,
            attempted: 1536,
        });
        assert_eq!(ErrorCategory::from_error(&err), ErrorCategory::Persistence);
    }

    #[test]
    fn test_dimension_mismatch_message_names_dimensions() {
        let err = DatabaseError::DimensionMismatch {
            entity: "chunk 42".to_string(),
            stored: 768,
            attempted: 1536,
        };
        let msg = err.to_string();
        assert!(msg.contains("768"));
        assert!(msg.contains("1536"));
        assert!(msg.contains("dimension mismatch"));
    }
}

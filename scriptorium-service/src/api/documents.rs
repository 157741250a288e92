//! Document endpoints: registration, inspection, and manual pipeline
//! triggers.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use super::AppState;
use crate::db::Document;
use crate::error::{ServiceError, ServiceResult, format_error_chain};

#[derive(Deserialize)]
pub struct RegisterDocumentRequest {
    pub title: String,
    /// Extracted text; extraction itself happens upstream.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub source_path: Option<String>,
}

#[derive(Serialize)]
pub struct DocumentSummary {
    #[serde(flatten)]
    pub document: Document,
    pub chunk_count: usize,
    pub embedded_chunk_count: usize,
}

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub status: &'static str,
    pub document_id: String,
}

pub async fn register_document_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterDocumentRequest>,
) -> ServiceResult<impl IntoResponse> {
    let doc = state
        .service
        .register_document(&request.title, request.text, request.source_path)?;
    Ok((StatusCode::CREATED, Json(doc)))
}

pub async fn list_documents_handler(
    State(state): State<Arc<AppState>>,
) -> ServiceResult<impl IntoResponse> {
    let docs = state.service.db.list_documents()?;
    Ok(Json(docs))
}

pub async fn get_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    let document = state
        .service
        .db
        .get_document(&id)?
        .ok_or_else(|| ServiceError::DocumentNotFound {
            document_id: id.clone(),
        })?;
    let chunk_count = state.service.db.chunk_count(&id)?;
    let embedded_chunk_count = state.service.db.embedded_chunk_count(&id)?;
    Ok(Json(DocumentSummary {
        document,
        chunk_count,
        embedded_chunk_count,
    }))
}

pub async fn get_document_chunks_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    state
        .service
        .db
        .get_document(&id)?
        .ok_or_else(|| ServiceError::DocumentNotFound {
            document_id: id.clone(),
        })?;
    let chunks = state.service.db.chunks_for_document(&id)?;
    Ok(Json(chunks))
}

/// Kick off immediate processing of one document without holding the request
/// open while the provider works.
pub async fn process_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    // existence check up front so the caller gets a 404 synchronously
    state
        .service
        .db
        .get_document(&id)?
        .ok_or_else(|| ServiceError::DocumentNotFound {
            document_id: id.clone(),
        })?;

    let service = state.service.clone();
    let document_id = id.clone();
    tokio::spawn(async move {
        if let Err(e) = service.process_document_now(&document_id).await {
            error!(
                doc_id = %document_id,
                error = %format_error_chain(&e),
                "manually triggered processing failed"
            );
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            status: "accepted",
            document_id: id,
        }),
    ))
}

pub async fn restart_document_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ServiceResult<impl IntoResponse> {
    state.service.restart_document(&id)?;
    Ok(Json(AcceptedResponse {
        status: "restarted",
        document_id: id,
    }))
}

#[derive(Serialize)]
pub struct SweepResponse {
    pub status: &'static str,
}

/// Sweep all pending work in the background.
pub async fn process_all_handler(
    State(state): State<Arc<AppState>>,
) -> ServiceResult<impl IntoResponse> {
    let service = state.service.clone();
    tokio::spawn(async move {
        match service.process_all_now().await {
            Ok(count) => tracing::info!(documents = count, "manual sweep finished"),
            Err(e) => error!(error = %format_error_chain(&e), "manual sweep failed"),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(SweepResponse { status: "accepted" }),
    ))
}

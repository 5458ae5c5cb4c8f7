use crate::models::ingest::{IngestDocumentRequest, IngestResponse};
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Ingest a pre-parsed document (parents + metadata)
/// POST /api/ingest/document
pub async fn ingest_document_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestDocumentRequest>,
) -> Result<Json<IngestResponse>, ApiError> {
    let request_id = Uuid::new_v4().to_string();
    info!(
        "Ingest request {}: document {} ({} parents)",
        request_id,
        req.document.document_id,
        req.parents.len()
    );

    let response = state.ingest.ingest_document(&request_id, req).await?;
    Ok(Json(response))
}

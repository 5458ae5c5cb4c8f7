use crate::models::chat::{AgentEvent, QueryRequest, QueryResponse, TurnMetadata};
use crate::services::{AgentOrchestrator, AgentRequest};
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::{extract::State, Json};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

/// Non-streaming agentic query
/// POST /api/agentic-rag/query
pub async fn agentic_query_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    let start = Instant::now();
    let conversation_id = req
        .conversation_id
        .clone()
        .unwrap_or_else(AgentOrchestrator::new_conversation_id);
    let request_id = Uuid::new_v4().to_string();

    info!(
        "Agentic query: request_id={}, conversation_id={}, user_id={}",
        request_id, conversation_id, req.user_id
    );

    // The cancel sender stays alive for the whole collection loop.
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let agent_request = AgentRequest {
        request_id,
        user_id: req.user_id,
        conversation_id,
        message: req.message,
        preferred_model: req.model,
    };

    let mut events = state
        .orchestrator
        .clone()
        .handle_message(agent_request, cancel_rx)
        .await?;

    let mut answer = String::new();
    let mut metadata: Option<TurnMetadata> = None;

    while let Some(event) = events.next().await {
        match event {
            AgentEvent::Token { delta } => answer.push_str(&delta),
            AgentEvent::Metadata(m) => metadata = Some(*m),
            AgentEvent::ToolCall { .. } => {}
            AgentEvent::Error { kind, message } => {
                return Err(error_from_kind(&kind, message));
            }
            AgentEvent::Done => break,
        }
    }

    let metadata = metadata.unwrap_or_default();

    Ok(Json(QueryResponse {
        answer,
        sources: metadata.sources,
        route_used: metadata.route_used,
        steps: metadata.steps,
        latency_ms: start.elapsed().as_millis() as u64,
        truncated: metadata.truncated,
    }))
}

fn error_from_kind(kind: &str, message: String) -> ApiError {
    match kind {
        "input_error" => ApiError::BadRequest(message),
        "retrieval_error" => ApiError::RetrievalError(message),
        "provider_error" => ApiError::ProviderError(message),
        "budget_exceeded" => ApiError::BudgetExceeded(message),
        "cancelled" => ApiError::Cancelled(message),
        "timeout" => ApiError::Timeout(message),
        "database_error" => ApiError::DatabaseError(message),
        "fatal_error" => ApiError::Fatal(message),
        _ => ApiError::InternalError(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping_round_trips() {
        let err = error_from_kind("provider_error", "all dead".into());
        assert_eq!(err.kind(), "provider_error");

        let err = error_from_kind("timeout", "too slow".into());
        assert_eq!(err.kind(), "timeout");

        let err = error_from_kind("something_new", "x".into());
        assert_eq!(err.kind(), "internal_error");
    }
}

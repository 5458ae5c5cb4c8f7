use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Retrieval error: {0}")]
    RetrievalError(String),

    #[error("Embedding error: {0}")]
    EmbeddingError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl ApiError {
    /// Stable kind label carried on the stream `error` event and in audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "input_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::DatabaseError(_) => "database_error",
            ApiError::RetrievalError(_) => "retrieval_error",
            ApiError::EmbeddingError(_) => "embedding_error",
            ApiError::ProviderError(_) => "provider_error",
            ApiError::BudgetExceeded(_) => "budget_exceeded",
            ApiError::Cancelled(_) => "cancelled",
            ApiError::Timeout(_) => "timeout",
            ApiError::Fatal(_) => "fatal_error",
            ApiError::InternalError(_) => "internal_error",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::NotFound(msg) => {
                tracing::warn!("Not found: {}", msg);
                (StatusCode::NOT_FOUND, "NotFound", msg)
            }
            ApiError::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError", msg)
            }
            ApiError::RetrievalError(msg) => {
                tracing::error!("Retrieval error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "RetrievalError", msg)
            }
            ApiError::EmbeddingError(msg) => {
                tracing::error!("Embedding error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "EmbeddingError", msg)
            }
            ApiError::ProviderError(msg) => {
                tracing::error!("Provider error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "ProviderError", msg)
            }
            ApiError::BudgetExceeded(msg) => {
                tracing::warn!("Budget exceeded: {}", msg);
                // Truncated answers are still 200s; this arm only fires when a
                // budget error escapes without a best-effort answer.
                (StatusCode::OK, "BudgetExceeded", msg)
            }
            ApiError::Cancelled(msg) => {
                tracing::info!("Cancelled: {}", msg);
                (StatusCode::REQUEST_TIMEOUT, "Cancelled", msg)
            }
            ApiError::Timeout(msg) => {
                tracing::warn!("Timeout: {}", msg);
                (StatusCode::GATEWAY_TIMEOUT, "Timeout", msg)
            }
            ApiError::Fatal(msg) => {
                tracing::error!("Fatal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "FatalError", msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds_are_stable() {
        assert_eq!(ApiError::BadRequest("x".into()).kind(), "input_error");
        assert_eq!(ApiError::Cancelled("x".into()).kind(), "cancelled");
        assert_eq!(ApiError::ProviderError("x".into()).kind(), "provider_error");
        assert_eq!(ApiError::Fatal("x".into()).kind(), "fatal_error");
    }
}

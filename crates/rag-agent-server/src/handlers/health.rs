use crate::state::AppState;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    version: String,
}

/// GET /api/health (liveness)
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}

#[derive(Serialize)]
pub struct DetailedHealthResponse {
    status: String,
    components: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    database: String,
    vector_store: String,
    llm_chain_head: String,
}

/// GET /api/health/detailed (readiness with component checks)
pub async fn detailed_health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<DetailedHealthResponse>) {
    let database = match state.repository.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let vector_store = match state.vector_store.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };

    let llm_chain_head = state
        .gateway
        .head_model()
        .unwrap_or_else(|| "error: empty chain".to_string());

    let healthy = database == "ok" && vector_store == "ok" && !llm_chain_head.starts_with("error");
    let status_code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(DetailedHealthResponse {
            status: if healthy { "ready" } else { "degraded" }.to_string(),
            components: ComponentHealth {
                database,
                vector_store,
                llm_chain_head,
            },
        }),
    )
}

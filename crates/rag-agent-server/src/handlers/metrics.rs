use crate::metrics::MetricsSnapshot;
use crate::services::session::SessionCacheStats;
use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

#[derive(Serialize)]
pub struct PerformanceResponse {
    counters: MetricsSnapshot,
    sessions: SessionCacheStats,
    audit_queue_length: usize,
    audit_queue_full: bool,
}

/// GET /api/performance/metrics
pub async fn performance_metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Json<PerformanceResponse> {
    Json(PerformanceResponse {
        counters: state.metrics.snapshot(),
        sessions: state.sessions.stats(),
        audit_queue_length: state.audit.queue_len(),
        audit_queue_full: state.audit.is_queue_full(),
    })
}

use std::sync::Arc;

use crate::config::Settings;
use crate::database::{DbPool, Repository};
use crate::llm::LlmGateway;
use crate::logging::AuditLogger;
use crate::metrics::PerformanceMetrics;
use crate::services::{AgentOrchestrator, IngestService, SessionCache};
use crate::vector::VectorStore;

/// Application state shared across handlers. Composed leaves-first at
/// startup: adapters and stores, then the retriever and tools, then the
/// orchestrator on top. No component calls back into the orchestrator.
#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub db_pool: DbPool,
    pub repository: Arc<Repository>,
    pub vector_store: Arc<VectorStore>,
    pub gateway: Arc<LlmGateway>,
    pub orchestrator: Arc<AgentOrchestrator>,
    pub ingest: Arc<IngestService>,
    pub sessions: SessionCache,
    pub metrics: Arc<PerformanceMetrics>,
    pub audit: AuditLogger,
}

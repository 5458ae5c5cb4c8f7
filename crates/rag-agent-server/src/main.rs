use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, TraceLayer},
};
use tracing::{info, warn};

use rag_agent_server::config::Settings;
use rag_agent_server::database::{
    ConversationStore, DbPool, GraphStore, MemoryStore, Repository, RouteStore,
};
use rag_agent_server::handlers;
use rag_agent_server::llm::LlmGateway;
use rag_agent_server::logging::{AuditLogger, LoggerConfig};
use rag_agent_server::metrics::PerformanceMetrics;
use rag_agent_server::services::scheduler::{
    ComplianceSweepTask, GoldenRoutePruneTask, GraphBuildTask, SessionCleanupTask,
};
use rag_agent_server::services::{
    AgentOrchestrator, EmbeddingService, GraphExtractor, HybridRetriever, IngestService,
    MemoryService, PreFilter, RemoteReranker, Scheduler, SessionCache, Verifier,
};
use rag_agent_server::state::AppState;
use rag_agent_server::tools::{
    calculator::CalculatorTool, graph_traversal::GraphTraversalTool,
    pricing::{PricingCatalogue, PricingLookupTool}, vector_search::VectorSearchTool,
    vision::VisionTool, ToolRegistry,
};
use rag_agent_server::utils::limiters::Limiters;
use rag_agent_server::vector::VectorStore;

const SESSION_TTL: Duration = Duration::from_secs(6 * 60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,rag_agent_server=debug".to_string()),
        )
        .with_target(true)
        .json()
        .init();

    info!("Starting RAG agent server...");

    // Configuration fails fast with a full list of missing keys.
    let settings = Settings::load()?;
    info!("Configuration loaded");

    // === Leaves first: pools, stores, adapters ===
    let db_pool = DbPool::new(&settings.database).await?;
    info!("Database connection established");

    let limiters = Arc::new(Limiters::new(&settings.limits));
    let metrics = Arc::new(PerformanceMetrics::new());
    let audit = AuditLogger::new(db_pool.get_pool().clone(), LoggerConfig::default());

    let repository = Arc::new(Repository::new(db_pool.clone()));
    let graph = Arc::new(GraphStore::new(db_pool.clone()));
    let memory_store = Arc::new(MemoryStore::new(db_pool.clone()));
    let conversations = Arc::new(ConversationStore::new(db_pool.clone()));
    let routes = Arc::new(RouteStore::new(db_pool.clone()));

    let vector_store = Arc::new(VectorStore::new(&settings.vector_store)?);
    for collection in &settings.vector_store.collections {
        vector_store
            .ensure_collection(&collection.name, collection.dimension)
            .await?;
    }
    info!(
        "Vector store ready ({} collections)",
        settings.vector_store.collections.len()
    );

    let embedding = Arc::new(EmbeddingService::new(
        settings.embedding.clone(),
        limiters.clone(),
        metrics.clone(),
    ));

    let reranker = Arc::new(RemoteReranker::new(
        settings.rerank.clone(),
        settings.rag.rerank_early_exit_top_k,
        limiters.clone(),
    ));

    // === Composition upward: retriever, gateway, tools ===
    let retriever = Arc::new(HybridRetriever::new(
        embedding.clone(),
        vector_store.clone(),
        reranker,
        repository.clone(),
        graph.clone(),
        routes.clone(),
        limiters.clone(),
        metrics.clone(),
        settings.rag.clone(),
        settings.features.clone(),
        settings.collection_names(),
    ));

    let gateway = Arc::new(LlmGateway::new(
        settings.llm.clone(),
        limiters.clone(),
        metrics.clone(),
    ));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(VectorSearchTool::new(
        retriever.clone(),
        settings.rag.retrieval_top_k,
        settings.rag.max_context_tokens,
    )));
    registry.register(Arc::new(GraphTraversalTool::new(graph.clone())));
    registry.register(Arc::new(CalculatorTool));

    let catalogue = PricingCatalogue::load(&settings.pricing.catalogue_path)?;
    catalogue.start_watcher()?;
    registry.register(Arc::new(PricingLookupTool::new(catalogue)));

    match settings
        .llm
        .model_chain
        .iter()
        .find(|endpoint| endpoint.supports_vision)
    {
        Some(endpoint) => {
            registry.register(Arc::new(VisionTool::new(
                endpoint.clone(),
                settings.llm.timeout_seconds,
            )));
        }
        None => warn!("No vision-capable model in chain; vision tool disabled"),
    }
    let tools = Arc::new(registry);

    // === Orchestrator on top; nothing calls back into it ===
    let memory = Arc::new(MemoryService::new(
        memory_store,
        conversations.clone(),
        gateway.clone(),
        settings.memory.clone(),
    ));
    let verifier = Arc::new(Verifier::new(gateway.clone()));
    let prefilter = PreFilter::new(gateway.clone());
    let sessions = SessionCache::new(SESSION_TTL);

    let orchestrator = Arc::new(AgentOrchestrator::new(
        memory,
        gateway.clone(),
        tools,
        verifier,
        conversations,
        sessions.clone(),
        prefilter,
        audit.clone(),
        metrics.clone(),
        settings.agent.clone(),
        settings.features.clone(),
        settings.prompts.clone(),
    ));

    let ingest = Arc::new(IngestService::new(
        repository.clone(),
        embedding,
        vector_store.clone(),
        settings.rag.default_collection.clone(),
        settings.rag.child_chunk_chars,
        audit.clone(),
    ));

    // === Background agents ===
    let mut scheduler = Scheduler::new(settings.scheduler.clone(), metrics.clone(), audit.clone());
    scheduler.register(
        settings.scheduler.graph_build_interval_seconds,
        Arc::new(GraphBuildTask {
            repository: repository.clone(),
            graph,
            extractor: Arc::new(GraphExtractor::new(gateway.clone())),
            batch_size: 25,
        }),
    );
    scheduler.register(
        settings.scheduler.golden_route_refresh_interval_seconds,
        Arc::new(GoldenRoutePruneTask {
            routes,
            min_hits: 2,
        }),
    );
    scheduler.register(
        settings.scheduler.session_cleanup_interval_seconds,
        Arc::new(SessionCleanupTask {
            sessions: sessions.clone(),
        }),
    );
    scheduler.register(
        settings.scheduler.compliance_sweep_interval_seconds,
        Arc::new(ComplianceSweepTask {
            repository: repository.clone(),
            audit: audit.clone(),
            document_batch: 200,
        }),
    );

    let state = Arc::new(AppState {
        settings: settings.clone(),
        db_pool,
        repository,
        vector_store,
        gateway,
        orchestrator,
        ingest,
        sessions,
        metrics,
        audit,
    });

    let app = build_router(state);

    let addr = SocketAddr::from((
        settings.server.host.parse::<std::net::IpAddr>()?,
        settings.server.port,
    ));
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    scheduler.shutdown().await;
    info!("Server stopped");

    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/chat/stream", post(handlers::chat::chat_stream_handler))
        .route(
            "/api/agentic-rag/query",
            post(handlers::query::agentic_query_handler),
        )
        .route(
            "/api/ingest/document",
            post(handlers::ingest::ingest_document_handler),
        )
        .route("/api/health", get(handlers::health::health_check))
        .route(
            "/api/health/detailed",
            get(handlers::health::detailed_health_check),
        )
        .route(
            "/api/performance/metrics",
            get(handlers::metrics::performance_metrics_handler),
        )
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::default().include_headers(false)),
        )
        .layer(DefaultBodyLimit::max(20 * 1024 * 1024))
}

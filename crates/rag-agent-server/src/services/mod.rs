pub mod agent;
pub mod embedding_service;
pub mod graph_extractor;
pub mod ingest;
pub mod memory_service;
pub mod reranker;
pub mod retriever;
pub mod scheduler;
pub mod session;
pub mod verifier;

pub use agent::{AgentOrchestrator, AgentRequest, PreFilter};
pub use embedding_service::EmbeddingService;
pub use graph_extractor::GraphExtractor;
pub use ingest::IngestService;
pub use memory_service::MemoryService;
pub use reranker::{RemoteReranker, Reranker};
pub use retriever::HybridRetriever;
pub use scheduler::Scheduler;
pub use session::SessionCache;
pub use verifier::Verifier;

pub mod settings;

pub use settings::{
    AgentConfig, DatabaseConfig, EmbeddingConfig, FeatureFlags, LimitsConfig, LlmConfig,
    MemoryConfig, ModelEndpoint, PricingConfig, PromptsConfig, RagConfig, RerankConfig,
    SchedulerConfig, ServerConfig, Settings, VectorStoreConfig,
};

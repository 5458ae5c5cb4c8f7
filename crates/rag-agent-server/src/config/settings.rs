use ::config::{Config, Environment, File};
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub vector_store: VectorStoreConfig,
    pub embedding: EmbeddingConfig,
    pub rerank: RerankConfig,
    pub llm: LlmConfig,
    pub rag: RagConfig,
    pub memory: MemoryConfig,
    pub agent: AgentConfig,
    pub features: FeatureFlags,
    pub limits: LimitsConfig,
    pub scheduler: SchedulerConfig,
    pub pricing: PricingConfig,
    pub prompts: PromptsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_max_size: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VectorStoreConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout_seconds: u64,
    /// Max points per upsert request; larger batches are split.
    pub max_batch_size: usize,
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CollectionConfig {
    pub name: String,
    pub dimension: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: usize,
    /// Inputs estimated above this are rejected unless the caller opts into truncation.
    pub max_input_tokens: usize,
    pub batch_size: usize,
    pub cache_size: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RerankConfig {
    pub enabled: bool,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    /// If the current top-k already scores above this, the model call is skipped.
    pub early_exit_threshold: f32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    /// Ordered fallback chain; the first healthy provider wins.
    pub model_chain: Vec<ModelEndpoint>,
    pub timeout_seconds: u64,
    pub max_tokens: usize,
    pub temperature: f32,
    pub retry_max_attempts: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ModelEndpoint {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    /// "openai" for any OpenAI-compatible server, "gemini" for the Google endpoint.
    pub provider: String,
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RagConfig {
    pub retrieval_top_k: usize,
    /// Constant k in reciprocal-rank fusion.
    pub rrf_k: f32,
    pub parent_ancestor_depth: usize,
    pub graph_expansion_depth: usize,
    pub golden_route_threshold: f32,
    pub rerank_early_exit_top_k: usize,
    pub max_context_tokens: usize,
    pub child_chunk_chars: usize,
    pub default_collection: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MemoryConfig {
    pub max_facts: usize,
    pub max_summary_tokens: usize,
    pub max_history_turns: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentConfig {
    pub step_budget: usize,
    pub tool_timeout_seconds: u64,
    pub llm_timeout_seconds: u64,
    pub turn_timeout_seconds: u64,
    pub conversation_lock_timeout_seconds: u64,
    pub verifier_max_rounds: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FeatureFlags {
    pub enable_verifier: bool,
    pub enable_graph_expansion: bool,
    pub enable_golden_route_cache: bool,
    /// When the vector or relational store is down, answer from the model
    /// alone instead of failing the request.
    pub degrade_on_retrieval_error: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LimitsConfig {
    pub embedding_concurrency: usize,
    pub vector_search_concurrency: usize,
    pub db_concurrency: usize,
    pub llm_concurrency: usize,
    pub rerank_concurrency: usize,
    pub acquire_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub graph_build_interval_seconds: u64,
    pub golden_route_refresh_interval_seconds: u64,
    pub session_cleanup_interval_seconds: u64,
    pub compliance_sweep_interval_seconds: u64,
    /// Tasks pause while average request latency exceeds this.
    pub backpressure_latency_ms: u64,
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PricingConfig {
    pub catalogue_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptsConfig {
    pub main_system_prompt: String,
    pub out_of_domain_refusal: String,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name("config/settings").required(true))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Fail fast with one diagnostic listing everything that is missing,
    /// instead of dying on the first bad key at some later call site.
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::new();

        if self.database.url.trim().is_empty() {
            missing.push("database.url");
        }
        if self.vector_store.url.trim().is_empty() {
            missing.push("vector_store.url");
        }
        if self.vector_store.collections.is_empty() {
            missing.push("vector_store.collections");
        }
        if self.embedding.base_url.trim().is_empty() {
            missing.push("embedding.base_url");
        }
        if self.llm.model_chain.is_empty() {
            missing.push("llm.model_chain");
        }
        for endpoint in &self.llm.model_chain {
            if endpoint.provider != "openai" && endpoint.provider != "gemini" {
                anyhow::bail!(
                    "Unknown LLM provider '{}' for model '{}' (expected 'openai' or 'gemini')",
                    endpoint.provider,
                    endpoint.model
                );
            }
        }

        if !missing.is_empty() {
            anyhow::bail!("Missing required configuration: {}", missing.join(", "));
        }

        if self.agent.step_budget == 0 {
            anyhow::bail!("agent.step_budget must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.rag.golden_route_threshold) {
            anyhow::bail!("rag.golden_route_threshold must be within [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.rerank.early_exit_threshold) {
            anyhow::bail!("rerank.early_exit_threshold must be within [0, 1]");
        }

        Ok(())
    }

    /// Collection names the retriever may route to.
    pub fn collection_names(&self) -> Vec<String> {
        self.vector_store
            .collections
            .iter()
            .map(|c| c.name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_settings() -> Settings {
        Settings {
            server: ServerConfig {
                host: "0.0.0.0".into(),
                port: 8080,
                request_timeout_seconds: 120,
            },
            database: DatabaseConfig {
                url: "postgres://localhost/rag".into(),
                pool_max_size: 10,
                pool_timeout_seconds: 5,
            },
            vector_store: VectorStoreConfig {
                url: "http://localhost:6333".into(),
                api_key: None,
                timeout_seconds: 15,
                max_batch_size: 64,
                collections: vec![CollectionConfig {
                    name: "legal_unified".into(),
                    dimension: 1536,
                }],
            },
            embedding: EmbeddingConfig {
                base_url: "http://localhost:8081".into(),
                api_key: None,
                model: "text-embedding-004".into(),
                dimension: 1536,
                max_input_tokens: 8000,
                batch_size: 16,
                cache_size: 4096,
            },
            rerank: RerankConfig {
                enabled: true,
                base_url: "http://localhost:8082".into(),
                api_key: None,
                model: "rerank-v2".into(),
                early_exit_threshold: 0.92,
                timeout_seconds: 10,
            },
            llm: LlmConfig {
                model_chain: vec![ModelEndpoint {
                    model: "gemini-2.0-flash".into(),
                    base_url: "https://generativelanguage.googleapis.com/v1beta/openai".into(),
                    api_key: Some("test".into()),
                    provider: "gemini".into(),
                    supports_tools: true,
                    supports_vision: true,
                }],
                timeout_seconds: 60,
                max_tokens: 2048,
                temperature: 0.3,
                retry_max_attempts: 2,
            },
            rag: RagConfig {
                retrieval_top_k: 10,
                rrf_k: 60.0,
                parent_ancestor_depth: 2,
                graph_expansion_depth: 2,
                golden_route_threshold: 0.97,
                rerank_early_exit_top_k: 3,
                max_context_tokens: 16_000,
                child_chunk_chars: 1500,
                default_collection: "legal_unified".into(),
            },
            memory: MemoryConfig {
                max_facts: 10,
                max_summary_tokens: 600,
                max_history_turns: 6,
            },
            agent: AgentConfig {
                step_budget: 6,
                tool_timeout_seconds: 20,
                llm_timeout_seconds: 60,
                turn_timeout_seconds: 120,
                conversation_lock_timeout_seconds: 120,
                verifier_max_rounds: 2,
            },
            features: FeatureFlags {
                enable_verifier: false,
                enable_graph_expansion: true,
                enable_golden_route_cache: true,
                degrade_on_retrieval_error: true,
            },
            limits: LimitsConfig {
                embedding_concurrency: 8,
                vector_search_concurrency: 8,
                db_concurrency: 16,
                llm_concurrency: 4,
                rerank_concurrency: 4,
                acquire_timeout_ms: 5000,
            },
            scheduler: SchedulerConfig {
                enabled: false,
                graph_build_interval_seconds: 3600,
                golden_route_refresh_interval_seconds: 3600,
                session_cleanup_interval_seconds: 300,
                compliance_sweep_interval_seconds: 86_400,
                backpressure_latency_ms: 2000,
                shutdown_grace_seconds: 10,
            },
            pricing: PricingConfig {
                catalogue_path: "config/pricing.toml".into(),
            },
            prompts: PromptsConfig {
                main_system_prompt: "You are a legal assistant.".into(),
                out_of_domain_refusal: "Out of scope.".into(),
            },
        }
    }

    #[test]
    fn test_valid_settings_pass() {
        assert!(minimal_settings().validate().is_ok());
    }

    #[test]
    fn test_missing_required_keys_listed_together() {
        let mut settings = minimal_settings();
        settings.database.url = String::new();
        settings.embedding.base_url = String::new();

        let err = settings.validate().unwrap_err().to_string();
        assert!(err.contains("database.url"));
        assert!(err.contains("embedding.base_url"));
    }

    #[test]
    fn test_empty_model_chain_rejected() {
        let mut settings = minimal_settings();
        settings.llm.model_chain.clear();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut settings = minimal_settings();
        settings.llm.model_chain[0].provider = "mystery".into();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_step_budget_rejected() {
        let mut settings = minimal_settings();
        settings.agent.step_budget = 0;
        assert!(settings.validate().is_err());
    }
}

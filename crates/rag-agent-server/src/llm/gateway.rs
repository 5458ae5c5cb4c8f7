use super::provider::{
    HttpChatProvider, LlmEvent, LlmEventStream, ProviderOutcome, ProviderRequest, ToolInvocation,
};
use super::tool_call::{build_tool_instructions, parse_text_tool_call};
use crate::config::LlmConfig;
use crate::metrics::PerformanceMetrics;
use crate::models::chat::{ChatMessage, ModelAttempt};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolSpec {
    fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Pin a specific model to the head of the chain for this call.
    pub preferred_model: Option<String>,
}

impl GenerationRequest {
    pub fn new(system_prompt: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            messages,
            tools: Vec::new(),
            max_tokens: None,
            temperature: None,
            preferred_model: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub model: String,
    pub attempts: Vec<ModelAttempt>,
}

pub struct LlmStream {
    pub model: String,
    pub attempts: Vec<ModelAttempt>,
    pub events: LlmEventStream,
}

/// Send-with-fallback over the configured model chain. A provider is skipped
/// only on `Retryable` outcomes (429, 5xx, timeouts); `Fatal` surfaces
/// immediately. The final error appears only when every provider failed.
///
/// Cancellation: dropping a returned stream aborts the in-flight provider
/// request at the transport level.
pub struct LlmGateway {
    providers: Vec<Arc<HttpChatProvider>>,
    config: LlmConfig,
    limiters: Arc<Limiters>,
    metrics: Arc<PerformanceMetrics>,
}

impl LlmGateway {
    pub fn new(
        config: LlmConfig,
        limiters: Arc<Limiters>,
        metrics: Arc<PerformanceMetrics>,
    ) -> Self {
        let providers = config
            .model_chain
            .iter()
            .map(|endpoint| {
                Arc::new(HttpChatProvider::new(
                    endpoint.clone(),
                    config.timeout_seconds,
                ))
            })
            .collect();

        Self {
            providers,
            config,
            limiters,
            metrics,
        }
    }

    pub fn head_model(&self) -> Option<String> {
        self.providers.first().map(|p| p.model().to_string())
    }

    fn chain_for(&self, preferred: Option<&str>) -> Vec<Arc<HttpChatProvider>> {
        let mut chain = self.providers.clone();
        if let Some(model) = preferred {
            if let Some(pos) = chain.iter().position(|p| p.model() == model) {
                let pinned = chain.remove(pos);
                chain.insert(0, pinned);
            } else {
                warn!("Requested model '{}' not in chain, using default order", model);
            }
        }
        chain
    }

    fn build_provider_request(
        &self,
        request: &GenerationRequest,
        provider: &HttpChatProvider,
    ) -> ProviderRequest {
        let mut system_prompt = request.system_prompt.clone();
        let mut tools = None;

        if !request.tools.is_empty() {
            if provider.supports_tools() {
                tools = Some(request.tools.iter().map(ToolSpec::to_wire).collect());
            } else {
                // Weak model: describe the TOOL:/ARGS: text protocol instead.
                system_prompt.push_str(&build_tool_instructions(&request.tools));
            }
        }

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(ChatMessage::system(system_prompt));
        messages.extend(request.messages.iter().cloned());

        ProviderRequest {
            messages,
            tools,
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            temperature: request.temperature.unwrap_or(self.config.temperature),
        }
    }

    pub async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ApiError> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.llm.clone(),
            self.limiters.acquire_timeout,
            "llm_generate",
        )
        .await
        .map_err(|e| ApiError::ProviderError(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, op = "llm_generate", "wait_queue");

        let mut attempts = Vec::new();
        let mut last_error = String::new();

        for provider in self.chain_for(request.preferred_model.as_deref()) {
            let provider_request = self.build_provider_request(request, &provider);

            match self.call_provider(&provider, &provider_request).await {
                ProviderOutcome::Ok(mut reply) => {
                    // Text-protocol fallback for providers without native tools.
                    if reply.tool_calls.is_empty() && !provider.supports_tools() {
                        if let Some((invocation, remaining)) = parse_text_tool_call(&reply.text) {
                            reply.tool_calls.push(invocation);
                            reply.text = remaining;
                        }
                    }

                    attempts.push(ModelAttempt::ok(provider.model()));
                    return Ok(Generation {
                        text: reply.text,
                        tool_calls: reply.tool_calls,
                        model: provider.model().to_string(),
                        attempts,
                    });
                }
                ProviderOutcome::Retryable(message) => {
                    last_error = message;
                    attempts.push(ModelAttempt::fail(provider.model()));
                    self.metrics
                        .provider_fallbacks
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    info!(
                        "Provider {} exhausted, advancing chain ({})",
                        provider.model(),
                        last_error
                    );
                }
                ProviderOutcome::Fatal(message) => {
                    // The chain advances only on retryable outcomes.
                    warn!("Provider {} fatal error: {}", provider.model(), message);
                    return Err(ApiError::ProviderError(message));
                }
            }
        }

        Err(ApiError::ProviderError(format!(
            "All providers failed, last error: {}",
            last_error
        )))
    }

    /// Retry one provider on retryable failures. The returned `Retryable`
    /// carries the last error after all attempts were spent.
    async fn call_provider(
        &self,
        provider: &HttpChatProvider,
        request: &ProviderRequest,
    ) -> ProviderOutcome<super::provider::ProviderReply> {
        let max_attempts = self.config.retry_max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match provider.generate(request).await {
                ProviderOutcome::Ok(reply) => return ProviderOutcome::Ok(reply),
                ProviderOutcome::Fatal(message) => return ProviderOutcome::Fatal(message),
                ProviderOutcome::Retryable(message) => {
                    last_error = message;
                    if attempt < max_attempts {
                        let wait = Duration::from_millis(400 * u64::from(attempt));
                        warn!(
                            "Provider {} attempt {}/{} failed: {}. Retrying in {:?}",
                            provider.model(),
                            attempt,
                            max_attempts,
                            last_error,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        ProviderOutcome::Retryable(last_error)
    }

    /// Streaming variant. The fallback chain applies at stream-open time;
    /// a provider that fails mid-stream surfaces as a stream error. For
    /// providers without native tool support, tokens are shadow-buffered and
    /// a trailing `TOOL:`/`ARGS:` directive is emitted as a `ToolCall` event
    /// before `Done`.
    pub async fn generate_stream(&self, request: &GenerationRequest) -> Result<LlmStream, ApiError> {
        let (permit, wait) = Limiters::acquire_timed(
            self.limiters.llm.clone(),
            self.limiters.acquire_timeout,
            "llm_stream",
        )
        .await
        .map_err(|e| ApiError::ProviderError(e.to_string()))?;
        debug!(wait_ms = wait.as_millis() as u64, op = "llm_stream", "wait_queue");

        let mut attempts = Vec::new();
        let mut last_error = String::new();
        let mut permit_slot = Some(permit);

        for provider in self.chain_for(request.preferred_model.as_deref()) {
            let provider_request = self.build_provider_request(request, &provider);

            let max_attempts = self.config.retry_max_attempts.max(1);
            let mut opened = None;
            for attempt in 1..=max_attempts {
                match provider.generate_stream(&provider_request).await {
                    ProviderOutcome::Ok(stream) => {
                        opened = Some(stream);
                        break;
                    }
                    ProviderOutcome::Fatal(message) => {
                        // The chain advances only on retryable outcomes.
                        warn!("Provider {} fatal error: {}", provider.model(), message);
                        return Err(ApiError::ProviderError(message));
                    }
                    ProviderOutcome::Retryable(message) => {
                        last_error = message;
                        if attempt < max_attempts {
                            tokio::time::sleep(Duration::from_millis(400 * u64::from(attempt)))
                                .await;
                        }
                    }
                }
            }

            let Some(events) = opened else {
                attempts.push(ModelAttempt::fail(provider.model()));
                self.metrics
                    .provider_fallbacks
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                info!(
                    "Provider {} stream open failed, advancing chain ({})",
                    provider.model(),
                    last_error
                );
                continue;
            };

            attempts.push(ModelAttempt::ok(provider.model()));
            let needs_text_fallback = !provider.supports_tools() && !request.tools.is_empty();
            if let Some(permit) = permit_slot.take() {
                let events = Self::wrap_stream(events, needs_text_fallback, permit);

                return Ok(LlmStream {
                    model: provider.model().to_string(),
                    attempts,
                    events,
                });
            }
        }

        Err(ApiError::ProviderError(format!(
            "All providers failed to open a stream, last error: {}",
            last_error
        )))
    }

    fn wrap_stream(
        mut inner: LlmEventStream,
        needs_text_fallback: bool,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> LlmEventStream {
        let stream = async_stream::stream! {
            // Hold the limiter slot for the lifetime of the stream.
            let _permit = permit;
            let mut shadow_text = String::new();

            while let Some(event) = inner.next().await {
                match event {
                    Ok(LlmEvent::Token(token)) => {
                        if needs_text_fallback {
                            shadow_text.push_str(&token);
                        }
                        yield Ok(LlmEvent::Token(token));
                    }
                    Ok(LlmEvent::Done { finish_reason }) => {
                        if needs_text_fallback {
                            if let Some((invocation, _)) = parse_text_tool_call(&shadow_text) {
                                yield Ok(LlmEvent::ToolCall(invocation));
                            }
                        }
                        yield Ok(LlmEvent::Done { finish_reason });
                        return;
                    }
                    other => yield other,
                }
            }
        };

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LimitsConfig, ModelEndpoint};

    fn gateway(chain: Vec<ModelEndpoint>) -> LlmGateway {
        let limits = LimitsConfig {
            embedding_concurrency: 2,
            vector_search_concurrency: 2,
            db_concurrency: 2,
            llm_concurrency: 2,
            rerank_concurrency: 2,
            acquire_timeout_ms: 100,
        };
        LlmGateway::new(
            LlmConfig {
                model_chain: chain,
                timeout_seconds: 1,
                max_tokens: 128,
                temperature: 0.1,
                retry_max_attempts: 1,
            },
            Arc::new(Limiters::new(&limits)),
            Arc::new(PerformanceMetrics::new()),
        )
    }

    fn endpoint(model: &str, supports_tools: bool) -> ModelEndpoint {
        ModelEndpoint {
            model: model.into(),
            base_url: "http://localhost:1".into(),
            api_key: None,
            provider: "openai".into(),
            supports_tools,
            supports_vision: false,
        }
    }

    #[test]
    fn test_preferred_model_moves_to_head() {
        let gw = gateway(vec![endpoint("primary", true), endpoint("secondary", true)]);
        let chain = gw.chain_for(Some("secondary"));
        assert_eq!(chain[0].model(), "secondary");
        assert_eq!(chain[1].model(), "primary");
    }

    #[test]
    fn test_unknown_preferred_model_keeps_order() {
        let gw = gateway(vec![endpoint("primary", true), endpoint("secondary", true)]);
        let chain = gw.chain_for(Some("missing"));
        assert_eq!(chain[0].model(), "primary");
    }

    #[test]
    fn test_weak_model_gets_text_protocol_instructions() {
        let gw = gateway(vec![endpoint("weak", false)]);
        let mut request = GenerationRequest::new("base prompt", vec![ChatMessage::user("hi")]);
        request.tools.push(ToolSpec {
            name: "calculator".into(),
            description: "Arithmetic".into(),
            parameters: serde_json::json!({"type": "object"}),
        });

        let provider_request = gw.build_provider_request(&request, &gw.providers[0]);
        assert!(provider_request.tools.is_none());
        assert!(provider_request.messages[0].content.contains("TOOL: tool_name ARGS:"));
    }

    #[test]
    fn test_native_model_gets_wire_tools() {
        let gw = gateway(vec![endpoint("strong", true)]);
        let mut request = GenerationRequest::new("base prompt", vec![ChatMessage::user("hi")]);
        request.tools.push(ToolSpec {
            name: "calculator".into(),
            description: "Arithmetic".into(),
            parameters: serde_json::json!({"type": "object"}),
        });

        let provider_request = gw.build_provider_request(&request, &gw.providers[0]);
        let tools = provider_request.tools.unwrap();
        assert_eq!(tools[0]["function"]["name"], "calculator");
        assert!(!provider_request.messages[0].content.contains("TOOL: tool_name"));
    }

    #[tokio::test]
    async fn test_unreachable_chain_reports_provider_error() {
        let gw = gateway(vec![endpoint("a", true), endpoint("b", true)]);
        let request = GenerationRequest::new("prompt", vec![ChatMessage::user("hi")]);

        let err = gw.generate(&request).await.unwrap_err();
        assert!(matches!(err, ApiError::ProviderError(_)));
    }
}

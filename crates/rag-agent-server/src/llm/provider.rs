use crate::config::ModelEndpoint;
use crate::models::chat::ChatMessage;
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: Value,
}

/// Typed events produced while consuming a provider stream.
#[derive(Debug, Clone)]
pub enum LlmEvent {
    Token(String),
    ToolCall(ToolInvocation),
    Done { finish_reason: String },
}

/// Tagged outcome used by the gateway to drive the fallback chain: only
/// `Retryable` advances to the next provider.
pub enum ProviderOutcome<T> {
    Ok(T),
    Retryable(String),
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<Value>>,
    pub max_tokens: usize,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
}

pub type LlmEventStream = Pin<Box<dyn Stream<Item = Result<LlmEvent, String>> + Send>>;

/// One OpenAI-compatible chat endpoint. Both the local llama-style servers
/// and the Gemini OpenAI-compat surface speak this wire format; they differ
/// only in URL layout.
pub struct HttpChatProvider {
    client: Client,
    endpoint: ModelEndpoint,
}

// ===== Wire types =====

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: usize,
    temperature: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize)]
struct WireToolCall {
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<DeltaToolCall>>,
}

#[derive(Debug, Deserialize)]
struct DeltaToolCall {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    function: Option<DeltaFunction>,
}

#[derive(Debug, Default, Deserialize)]
struct DeltaFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

impl HttpChatProvider {
    pub fn new(endpoint: ModelEndpoint, timeout_seconds: u64) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint,
        }
    }

    pub fn model(&self) -> &str {
        &self.endpoint.model
    }

    pub fn supports_tools(&self) -> bool {
        self.endpoint.supports_tools
    }

    fn completions_url(&self) -> String {
        let base = self.endpoint.base_url.trim_end_matches('/');
        match self.endpoint.provider.as_str() {
            // Gemini's OpenAI-compat base already ends in .../v1beta/openai
            "gemini" => format!("{}/chat/completions", base),
            _ => format!("{}/v1/chat/completions", base),
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {}", key)),
            None => builder,
        }
    }

    fn classify_status(status: reqwest::StatusCode, body: String) -> ProviderOutcome<()> {
        let message = format!("{} - {}", status, body);
        if status.as_u16() == 429 || status.is_server_error() {
            ProviderOutcome::Retryable(message)
        } else {
            ProviderOutcome::Fatal(message)
        }
    }

    /// Non-streaming completion.
    pub async fn generate(&self, request: &ProviderRequest) -> ProviderOutcome<ProviderReply> {
        let body = ChatCompletionRequest {
            model: &self.endpoint.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: false,
            tools: request.tools.as_deref(),
        };

        let response = match self
            .apply_auth(self.client.post(self.completions_url()))
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProviderOutcome::Retryable(format!("connect: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return match Self::classify_status(status, body) {
                ProviderOutcome::Retryable(m) => ProviderOutcome::Retryable(m),
                ProviderOutcome::Fatal(m) => ProviderOutcome::Fatal(m),
                ProviderOutcome::Ok(_) => unreachable!(),
            };
        }

        let parsed: ChatCompletionResponse = match response.json().await {
            Ok(p) => p,
            Err(e) => return ProviderOutcome::Retryable(format!("parse: {}", e)),
        };

        let Some(choice) = parsed.choices.into_iter().next() else {
            return ProviderOutcome::Retryable("empty choices".to_string());
        };

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter_map(|call| match serde_json::from_str(&call.function.arguments) {
                Ok(arguments) => Some(ToolInvocation {
                    name: call.function.name,
                    arguments,
                }),
                Err(e) => {
                    warn!(
                        "Dropping tool call '{}' with unparseable args: {}",
                        call.function.name, e
                    );
                    None
                }
            })
            .collect();

        ProviderOutcome::Ok(ProviderReply {
            text: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }

    /// Open a streaming completion. SSE frames are re-assembled across
    /// network chunks; native tool-call deltas are accumulated per index and
    /// emitted once complete.
    pub async fn generate_stream(
        &self,
        request: &ProviderRequest,
    ) -> ProviderOutcome<LlmEventStream> {
        let body = ChatCompletionRequest {
            model: &self.endpoint.model,
            messages: &request.messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: true,
            tools: request.tools.as_deref(),
        };

        let response = match self
            .apply_auth(self.client.post(self.completions_url()))
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return ProviderOutcome::Retryable(format!("connect: {}", e)),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return match Self::classify_status(status, body) {
                ProviderOutcome::Retryable(m) => ProviderOutcome::Retryable(m),
                ProviderOutcome::Fatal(m) => ProviderOutcome::Fatal(m),
                ProviderOutcome::Ok(_) => unreachable!(),
            };
        }

        let model = self.endpoint.model.clone();
        let mut byte_stream = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut line_buffer = String::new();
            let mut pending_tools: BTreeMap<usize, (String, String)> = BTreeMap::new();
            let mut finish_reason = "stop".to_string();

            'outer: while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        yield Err(format!("stream error: {}", e));
                        return;
                    }
                };

                line_buffer.push_str(&String::from_utf8_lossy(&bytes));

                // SSE frames may split anywhere; only parse complete lines.
                while let Some(newline) = line_buffer.find('\n') {
                    let line = line_buffer[..newline].trim().to_string();
                    line_buffer.drain(..=newline);

                    let Some(json_str) = line.strip_prefix("data: ") else {
                        continue;
                    };

                    if json_str == "[DONE]" {
                        break 'outer;
                    }

                    let parsed: ChatCompletionChunk = match serde_json::from_str(json_str) {
                        Ok(c) => c,
                        Err(e) => {
                            debug!("Skipping malformed SSE chunk from {}: {}", model, e);
                            continue;
                        }
                    };

                    for choice in parsed.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                yield Ok(LlmEvent::Token(content));
                            }
                        }

                        for delta_call in choice.delta.tool_calls.unwrap_or_default() {
                            let entry = pending_tools
                                .entry(delta_call.index)
                                .or_insert_with(|| (String::new(), String::new()));
                            if let Some(function) = delta_call.function {
                                if let Some(name) = function.name {
                                    entry.0.push_str(&name);
                                }
                                if let Some(arguments) = function.arguments {
                                    entry.1.push_str(&arguments);
                                }
                            }
                        }

                        if let Some(reason) = choice.finish_reason {
                            finish_reason = reason;
                        }
                    }
                }
            }

            for (_, (name, arguments)) in pending_tools {
                match serde_json::from_str::<Value>(&arguments) {
                    Ok(parsed_args) => {
                        yield Ok(LlmEvent::ToolCall(ToolInvocation {
                            name,
                            arguments: parsed_args,
                        }));
                    }
                    Err(e) => {
                        warn!("Dropping tool call '{}' with unparseable args: {}", name, e);
                    }
                }
            }

            yield Ok(LlmEvent::Done { finish_reason });
        };

        ProviderOutcome::Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(provider: &str, base: &str) -> ModelEndpoint {
        ModelEndpoint {
            model: "test-model".into(),
            base_url: base.into(),
            api_key: None,
            provider: provider.into(),
            supports_tools: true,
            supports_vision: false,
        }
    }

    #[test]
    fn test_openai_url_layout() {
        let provider = HttpChatProvider::new(endpoint("openai", "http://localhost:8090/"), 5);
        assert_eq!(
            provider.completions_url(),
            "http://localhost:8090/v1/chat/completions"
        );
    }

    #[test]
    fn test_gemini_url_layout() {
        let provider = HttpChatProvider::new(
            endpoint(
                "gemini",
                "https://generativelanguage.googleapis.com/v1beta/openai",
            ),
            5,
        );
        assert_eq!(
            provider.completions_url(),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
    }

    #[test]
    fn test_retryable_status_classification() {
        assert!(matches!(
            HttpChatProvider::classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "".into()),
            ProviderOutcome::Retryable(_)
        ));
        assert!(matches!(
            HttpChatProvider::classify_status(
                reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                "".into()
            ),
            ProviderOutcome::Retryable(_)
        ));
        assert!(matches!(
            HttpChatProvider::classify_status(reqwest::StatusCode::UNAUTHORIZED, "".into()),
            ProviderOutcome::Fatal(_)
        ));
    }
}

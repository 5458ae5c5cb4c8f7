use serde::{Deserialize, Serialize};

pub type ConversationId = String;

// ===== REQUEST MODELS =====

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    /// Optional override for the head of the model chain.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: content.into(),
        }
    }

    pub fn estimate_tokens(&self) -> usize {
        crate::utils::token_estimator::estimate_tokens(&self.content)
    }
}

// ===== STREAM EVENT MODELS =====

/// Events emitted over `/api/chat/stream`. Exactly one `Done` or `Error`
/// terminates every request, after all other events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Token {
        delta: String,
    },
    ToolCall {
        name: String,
        args: serde_json::Value,
    },
    Metadata(Box<TurnMetadata>),
    Error {
        kind: String,
        message: String,
    },
    Done,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TurnMetadata {
    pub sources: Vec<SourceInfo>,
    pub route_used: String,
    pub route_cached: bool,
    pub model_chain: Vec<ModelAttempt>,
    pub steps: usize,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verifier: Option<VerifierInfo>,
    pub prompt_tokens_estimate: usize,
    pub completion_tokens_estimate: usize,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceInfo {
    /// Stable parent chunk key, e.g. "PP_31_2013:BAB_II/Pasal_5".
    pub passage_id: String,
    pub document_id: String,
    pub hierarchy_path: String,
    pub collection: String,
    pub score: f32,
    /// First ~150 chars of the child text.
    pub preview: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelAttempt {
    pub model: String,
    pub outcome: String, // "ok" | "fail"
}

impl ModelAttempt {
    pub fn ok(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            outcome: "ok".to_string(),
        }
    }

    pub fn fail(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            outcome: "fail".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifierInfo {
    pub status: String,
    pub score: f32,
}

// ===== NON-STREAMING VARIANT =====

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub user_id: String,
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub answer: String,
    pub sources: Vec<SourceInfo>,
    pub route_used: String,
    pub steps: usize,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_carries_type_tag() {
        let event = AgentEvent::Token {
            delta: "Halo".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "token");
        assert_eq!(json["delta"], "Halo");
    }

    #[test]
    fn test_done_event_is_bare() {
        let json = serde_json::to_value(AgentEvent::Done).unwrap();
        assert_eq!(json, serde_json::json!({"type": "done"}));
    }

    #[test]
    fn test_tool_call_event_shape() {
        let event = AgentEvent::ToolCall {
            name: "vector_search".to_string(),
            args: serde_json::json!({"query": "masa berlaku PP 31/2013", "top_k": 5}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_call");
        assert_eq!(json["name"], "vector_search");
        assert_eq!(json["args"]["top_k"], 5);
    }

    #[test]
    fn test_metadata_event_includes_model_chain() {
        let metadata = TurnMetadata {
            route_used: "legal_unified".to_string(),
            model_chain: vec![
                ModelAttempt::fail("gemini-2.0-flash"),
                ModelAttempt::ok("gemini-1.5-pro"),
            ],
            ..Default::default()
        };
        let json = serde_json::to_value(AgentEvent::Metadata(Box::new(metadata))).unwrap();
        assert_eq!(json["type"], "metadata");
        assert_eq!(json["model_chain"][0]["outcome"], "fail");
        assert_eq!(json["model_chain"][1]["outcome"], "ok");
    }
}

//! Typed tools the agent may invoke. The registry is flat: each tool is a
//! record of name, description, JSON parameter schema and an async handler.
//! Arguments are validated against the schema before dispatch; failures come
//! back as structured tool errors, never as aborts.

pub mod calculator;
pub mod graph_traversal;
pub mod pricing;
pub mod vector_search;
pub mod vision;

use crate::models::chat::SourceInfo;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    Unknown(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Tool failed: {0}")]
    Failed(String),
}

/// What a tool hands back to the loop: a textual observation for the model,
/// plus structured sources and routing info for citation tracking.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub observation: String,
    pub sources: Vec<SourceInfo>,
    pub route_used: Option<String>,
    pub route_cached: bool,
}

impl ToolOutput {
    pub fn text(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            ..Default::default()
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError>;
}

pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
    order: Vec<&'static str>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        if self.tools.insert(name, tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn specs(&self) -> Vec<crate::llm::ToolSpec> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| crate::llm::ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<ToolOutput, ToolError> {
        let Some(tool) = self.tools.get(name) else {
            return Err(ToolError::Unknown(name.to_string()));
        };

        validate_args(&tool.parameters_schema(), &args)?;
        tool.execute(args).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal JSON-schema check: required keys present, declared property types
/// match. Enough to reject malformed model output before a handler sees it.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), ToolError> {
    let Some(args_object) = args.as_object() else {
        return Err(ToolError::InvalidArgs(
            "arguments must be a JSON object".to_string(),
        ));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_object.contains_key(key) {
                return Err(ToolError::InvalidArgs(format!(
                    "missing required parameter '{}'",
                    key
                )));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, value) in args_object {
        let Some(declared) = properties.get(key) else {
            continue; // Unknown extras are ignored, not fatal.
        };
        let Some(expected) = declared.get("type").and_then(Value::as_str) else {
            continue;
        };

        let ok = match expected {
            "string" => value.is_string(),
            "integer" => value.is_i64() || value.is_u64(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "array" => value.is_array(),
            "object" => value.is_object(),
            _ => true,
        };

        if !ok {
            return Err(ToolError::InvalidArgs(format!(
                "parameter '{}' should be of type {}",
                key, expected
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echoes its input."
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "repeat": {"type": "integer"}
                },
                "required": ["text"]
            })
        }

        async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(
                args["text"].as_str().unwrap_or_default().to_string(),
            ))
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry
    }

    #[tokio::test]
    async fn test_dispatch_known_tool() {
        let output = registry()
            .execute("echo", json!({"text": "halo"}))
            .await
            .unwrap();
        assert_eq!(output.observation, "halo");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_structured_error() {
        let err = registry().execute("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_missing_required_arg_rejected() {
        let err = registry().execute("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[tokio::test]
    async fn test_wrong_type_rejected() {
        let err = registry()
            .execute("echo", json!({"text": "x", "repeat": "three"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }

    #[test]
    fn test_specs_preserve_registration_order() {
        let specs = registry().specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
    }

    #[test]
    fn test_non_object_args_rejected() {
        let schema = json!({"type": "object"});
        assert!(validate_args(&schema, &json!("just a string")).is_err());
    }

    #[tokio::test]
    async fn test_validation_runs_before_dispatch() {
        let mut mock = MockTool::new();
        mock.expect_name().return_const("strict");
        mock.expect_parameters_schema().returning(|| {
            json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            })
        });
        // The handler must never run when validation fails.
        mock.expect_execute().never();

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(mock));

        let err = registry.execute("strict", json!({})).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArgs(_)));
    }
}

use super::{Tool, ToolError, ToolOutput};
use crate::config::ModelEndpoint;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Describe an image (document scan, permit photo) with a vision-capable
/// provider. The image is fetched server-side and inlined as base64 so the
/// provider never needs access to internal URLs.
pub struct VisionTool {
    client: Client,
    endpoint: ModelEndpoint,
}

impl VisionTool {
    pub fn new(endpoint: ModelEndpoint, timeout_seconds: u64) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            endpoint,
        }
    }

    fn completions_url(&self) -> String {
        let base = self.endpoint.base_url.trim_end_matches('/');
        match self.endpoint.provider.as_str() {
            "gemini" => format!("{}/chat/completions", base),
            _ => format!("{}/v1/chat/completions", base),
        }
    }

    async fn fetch_image_data_url(&self, image_url: &str) -> Result<String, ToolError> {
        let response = self
            .client
            .get(image_url)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("Failed to fetch image: {}", e)))?;

        if !response.status().is_success() {
            return Err(ToolError::Failed(format!(
                "Image fetch returned {}",
                response.status()
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ToolError::Failed(format!("Failed to read image body: {}", e)))?;

        Ok(data_url(&content_type, &bytes))
    }
}

fn data_url(content_type: &str, bytes: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    format!("data:{};base64,{}", content_type, encoded)
}

/// Pull the description out of an OpenAI-compatible completion response.
fn extract_answer(response: &Value) -> String {
    response["choices"][0]["message"]["content"]
        .as_str()
        .unwrap_or("(no description returned)")
        .to_string()
}

#[async_trait]
impl Tool for VisionTool {
    fn name(&self) -> &'static str {
        "vision"
    }

    fn description(&self) -> &'static str {
        "Describe or answer a question about an image (e.g. a scanned permit or \
         passport page). Input an image URL and a question."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "image_url": {
                    "type": "string",
                    "description": "URL of the image to inspect"
                },
                "question": {
                    "type": "string",
                    "description": "What to look for in the image"
                }
            },
            "required": ["image_url", "question"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let image_url = args["image_url"].as_str().unwrap_or_default();
        let question = args["question"].as_str().unwrap_or_default();

        let data_url = self.fetch_image_data_url(image_url).await?;
        debug!("Vision request for image of {} chars", data_url.len());

        let body = json!({
            "model": self.endpoint.model,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": question},
                    {"type": "image_url", "image_url": {"url": data_url}}
                ]
            }],
            "max_tokens": 512,
        });

        let mut builder = self.client.post(self.completions_url());
        if let Some(key) = &self.endpoint.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| ToolError::Failed(format!("Vision provider error: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ToolError::Failed(format!(
                "Vision provider error ({}): {}",
                status, body
            )));
        }

        let parsed: Value = response
            .json()
            .await
            .map_err(|e| ToolError::Failed(format!("Vision parse error: {}", e)))?;

        Ok(ToolOutput::text(extract_answer(&parsed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelEndpoint;

    fn endpoint(provider: &str, base: &str) -> ModelEndpoint {
        ModelEndpoint {
            model: "gemini-2.0-flash".into(),
            base_url: base.into(),
            api_key: None,
            provider: provider.into(),
            supports_tools: true,
            supports_vision: true,
        }
    }

    #[test]
    fn test_gemini_url_layout() {
        let tool = VisionTool::new(
            endpoint(
                "gemini",
                "https://generativelanguage.googleapis.com/v1beta/openai/",
            ),
            5,
        );
        assert_eq!(
            tool.completions_url(),
            "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
        );
    }

    #[test]
    fn test_openai_url_layout() {
        let tool = VisionTool::new(endpoint("openai", "http://localhost:8090"), 5);
        assert_eq!(
            tool.completions_url(),
            "http://localhost:8090/v1/chat/completions"
        );
    }

    #[test]
    fn test_data_url_encoding() {
        let url = data_url("image/png", b"abc");
        assert_eq!(url, "data:image/png;base64,YWJj");
    }

    #[test]
    fn test_extract_answer_from_completion() {
        let response = json!({
            "choices": [{
                "message": {"content": "Paspor Indonesia, halaman data."}
            }]
        });
        assert_eq!(
            extract_answer(&response),
            "Paspor Indonesia, halaman data."
        );
    }

    #[test]
    fn test_extract_answer_falls_back_on_malformed_response() {
        assert_eq!(
            extract_answer(&json!({"choices": []})),
            "(no description returned)"
        );
        assert_eq!(
            extract_answer(&json!({})),
            "(no description returned)"
        );
    }
}

use super::filter::Filter;
use crate::utils::similarity::normalize_score;
use anyhow::{anyhow, Result};
use rand::Rng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Qdrant REST client for vector operations. All calls run behind
/// retry-with-backoff: idempotent reads retry on any transient failure,
/// upserts only on 429/5xx; other 4xx surface immediately.
pub struct VectorStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    max_batch_size: usize,
}

const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;

/// Payload carried by every indexed child chunk. The relational store owns
/// the text; `parent_chunk_ids` keys back into it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChildPayload {
    pub document_id: String,
    pub parent_chunk_ids: Vec<String>,
    pub hierarchy_path: String,
    pub text: String,
    pub tier: String,
    pub language: String,
    #[serde(default)]
    pub chunk_index: i32,
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive_link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: ChildPayload,
}

#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: String,
    /// Similarity normalized into [0, 1]; always finite.
    pub score: f32,
    pub payload: ChildPayload,
}

#[derive(Debug, Clone)]
pub struct ScrollPage {
    pub points: Vec<(String, ChildPayload)>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QdrantResponse<T> {
    result: Option<T>,
    #[serde(default)]
    status: Value,
}

enum CallError {
    Retryable(String),
    Permanent(String),
}

impl VectorStore {
    pub fn new(cfg: &crate::config::VectorStoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: cfg.url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            max_batch_size: cfg.max_batch_size.max(1),
        })
    }

    async fn call(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> std::result::Result<Value, CallError> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.client.request(method, &url);
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => return Err(CallError::Retryable(format!("network error: {}", e))),
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("vector store error ({}): {}", status, text);
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(CallError::Retryable(message))
            } else {
                Err(CallError::Permanent(message))
            };
        }

        let parsed: QdrantResponse<Value> = response
            .json()
            .await
            .map_err(|e| CallError::Retryable(format!("malformed response: {}", e)))?;

        debug!(status = %parsed.status, path = path, "vector store call ok");
        Ok(parsed.result.unwrap_or(Value::Null))
    }

    /// Retry wrapper. `retry_permanent` is always false for writes; reads are
    /// idempotent so anything transient is worth another attempt.
    async fn call_with_retry(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
        op: &'static str,
    ) -> Result<Value> {
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.call(method.clone(), path, body).await {
                Ok(value) => return Ok(value),
                Err(CallError::Permanent(message)) => {
                    anyhow::bail!("{} failed: {}", op, message);
                }
                Err(CallError::Retryable(message)) => {
                    last_error = message;
                    if attempt < MAX_ATTEMPTS {
                        let jitter = rand::rng().random_range(0..100);
                        let wait = BACKOFF_BASE_MS * u64::from(attempt) + jitter;
                        warn!(
                            "{} attempt {}/{} failed ({}), retrying in {}ms",
                            op, attempt, MAX_ATTEMPTS, last_error, wait
                        );
                        tokio::time::sleep(Duration::from_millis(wait)).await;
                    }
                }
            }
        }

        anyhow::bail!("{} failed after {} attempts: {}", op, MAX_ATTEMPTS, last_error)
    }

    /// Create the collection if it does not exist yet.
    pub async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let path = format!("/collections/{}", name);
        if self
            .call(reqwest::Method::GET, &path, None)
            .await
            .is_ok()
        {
            debug!("Collection '{}' already exists", name);
            return Ok(());
        }

        let body = json!({
            "vectors": {
                "size": dimension,
                "distance": "Cosine",
            }
        });

        self.call_with_retry(reqwest::Method::PUT, &path, Some(&body), "create_collection")
            .await?;

        info!("Created collection '{}' with dimension {}", name, dimension);
        Ok(())
    }

    /// Upsert points, splitting into provider-sized batches. A partially
    /// failed batch is treated as fully failed and retried whole.
    pub async fn upsert(&self, collection: &str, points: Vec<VectorPoint>) -> Result<usize> {
        if points.is_empty() {
            return Ok(0);
        }

        let path = format!("/collections/{}/points?wait=true", collection);
        let total = points.len();

        for batch in points.chunks(self.max_batch_size) {
            let body = json!({
                "points": batch
                    .iter()
                    .map(|p| {
                        json!({
                            "id": p.id,
                            "vector": p.vector,
                            "payload": p.payload,
                        })
                    })
                    .collect::<Vec<_>>(),
            });

            self.call_with_retry(reqwest::Method::PUT, &path, Some(&body), "upsert")
                .await?;
        }

        debug!("Upserted {} points into '{}'", total, collection);
        Ok(total)
    }

    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        top_k: usize,
        filter: Option<&Filter>,
    ) -> Result<Vec<ScoredPoint>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let path = format!("/collections/{}/points/search", collection);
        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            if !filter.is_empty() {
                body["filter"] = filter.to_qdrant();
            }
        }

        let result = self
            .call_with_retry(reqwest::Method::POST, &path, Some(&body), "search")
            .await?;

        let hits = result
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|hit| {
                let id = hit.get("id")?.to_string().trim_matches('"').to_string();
                let raw_score = hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32;
                let payload: ChildPayload =
                    serde_json::from_value(hit.get("payload")?.clone()).ok()?;

                Some(ScoredPoint {
                    id,
                    score: normalize_score(raw_score),
                    payload,
                })
            })
            .collect();

        Ok(hits)
    }

    pub async fn scroll(
        &self,
        collection: &str,
        cursor: Option<String>,
        limit: usize,
        filter: Option<&Filter>,
    ) -> Result<ScrollPage> {
        let path = format!("/collections/{}/points/scroll", collection);
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
        });
        if let Some(cursor) = cursor {
            body["offset"] = json!(cursor);
        }
        if let Some(filter) = filter {
            if !filter.is_empty() {
                body["filter"] = filter.to_qdrant();
            }
        }

        let result = self
            .call_with_retry(reqwest::Method::POST, &path, Some(&body), "scroll")
            .await?;

        let points = result
            .get("points")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|point| {
                let id = point.get("id")?.to_string().trim_matches('"').to_string();
                let payload: ChildPayload =
                    serde_json::from_value(point.get("payload")?.clone()).ok()?;
                Some((id, payload))
            })
            .collect();

        let next_cursor = result
            .get("next_page_offset")
            .filter(|v| !v.is_null())
            .map(|v| v.to_string().trim_matches('"').to_string());

        Ok(ScrollPage { points, next_cursor })
    }

    pub async fn delete(&self, collection: &str, filter: &Filter) -> Result<()> {
        let path = format!("/collections/{}/points/delete?wait=true", collection);
        let body = json!({ "filter": filter.to_qdrant() });

        self.call_with_retry(reqwest::Method::POST, &path, Some(&body), "delete")
            .await?;

        debug!("Deleted points from '{}'", collection);
        Ok(())
    }

    pub async fn collection_stats(&self, collection: &str) -> Result<Value> {
        let path = format!("/collections/{}", collection);
        self.call_with_retry(reqwest::Method::GET, &path, None, "stats")
            .await
    }

    pub async fn ping(&self) -> Result<()> {
        self.call_with_retry(reqwest::Method::GET, "/collections", None, "ping")
            .await?;
        Ok(())
    }
}

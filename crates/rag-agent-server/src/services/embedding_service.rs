use crate::config::EmbeddingConfig;
use crate::metrics::PerformanceMetrics;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use crate::utils::lru::LruCache;
use crate::utils::token_estimator;
use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Clone)]
pub struct EmbeddingService {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model_name: String,
    pub dimension: usize,
    max_input_tokens: usize,
    batch_size: usize,
    cache: Arc<LruCache<Vec<f32>>>,
    limiters: Arc<Limiters>,
    metrics: Arc<PerformanceMetrics>,
}

const MAX_ATTEMPTS: u32 = 3;

impl EmbeddingService {
    pub fn new(
        config: EmbeddingConfig,
        limiters: Arc<Limiters>,
        metrics: Arc<PerformanceMetrics>,
    ) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.base_url,
            api_key: config.api_key,
            model_name: config.model,
            dimension: config.dimension,
            max_input_tokens: config.max_input_tokens,
            batch_size: config.batch_size.max(1),
            cache: Arc::new(LruCache::new(config.cache_size)),
            limiters,
            metrics,
        }
    }

    /// Single-text shortcut (Public API)
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, ApiError> {
        let mut result = self
            .embed_batch(vec![text.to_string()], false)
            .await?;
        Ok(result.remove(0))
    }

    /// Batch embedding. Input order is preserved in the output; requests to
    /// the provider are grouped into `batch_size` sub-batches. Texts beyond
    /// the provider token bound are rejected unless `allow_truncation`.
    pub async fn embed_batch(
        &self,
        texts: Vec<String>,
        allow_truncation: bool,
    ) -> Result<Vec<Vec<f32>>, ApiError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut prepared = Vec::with_capacity(texts.len());
        for text in texts {
            prepared.push(self.prepare_input(text, allow_truncation)?);
        }

        // Resolve cache hits first; only misses go to the provider.
        let mut results: Vec<Option<Vec<f32>>> = vec![None; prepared.len()];
        let mut misses: Vec<(usize, String)> = Vec::new();

        for (i, text) in prepared.iter().enumerate() {
            let key = self.cache_key(text);
            if let Some(embedding) = self.cache.get(&key) {
                self.metrics
                    .embedding_cache_hits
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                results[i] = Some(embedding);
            } else {
                self.metrics
                    .embedding_cache_misses
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                misses.push((i, text.clone()));
            }
        }

        for batch in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let embeddings = self
                .embed_remote(&inputs)
                .await
                .map_err(|e| ApiError::EmbeddingError(e.to_string()))?;

            for ((index, text), embedding) in batch.iter().zip(embeddings) {
                self.cache.put(self.cache_key(text), embedding.clone());
                results[*index] = Some(embedding);
            }
        }

        Ok(results.into_iter().map(|r| r.unwrap_or_default()).collect())
    }

    fn prepare_input(&self, text: String, allow_truncation: bool) -> Result<String, ApiError> {
        let tokens = token_estimator::estimate_tokens(&text);
        if tokens <= self.max_input_tokens {
            return Ok(text);
        }

        if !allow_truncation {
            return Err(ApiError::BadRequest(format!(
                "Embedding input of ~{} tokens exceeds the provider bound of {}",
                tokens, self.max_input_tokens
            )));
        }

        // Words track the token estimate, so cut on a word boundary. The
        // estimator adds a small fixed overhead; budget for it.
        let max_words = (self.max_input_tokens.saturating_sub(5) as f64 / 1.3) as usize;
        let truncated: String = text
            .split_whitespace()
            .take(max_words)
            .collect::<Vec<_>>()
            .join(" ");
        warn!(
            "Truncated embedding input from ~{} to ~{} tokens",
            tokens, self.max_input_tokens
        );
        Ok(truncated)
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.model_name.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    async fn embed_remote(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.embedding.clone(),
            self.limiters.acquire_timeout,
            "embedding",
        )
        .await?;

        debug!(wait_ms = wait.as_millis() as u64, op = "embedding", "wait_queue");

        let request = EmbeddingRequest {
            input: inputs.to_vec(),
            model: self.model_name.clone(),
        };
        let url = format!("{}/v1/embeddings", self.base_url);

        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let exec_start = Instant::now();

            match self.send_once(&url, &request).await {
                Ok(embeddings) => {
                    debug!(
                        exec_ms = exec_start.elapsed().as_millis() as u64,
                        batch = inputs.len(),
                        op = "embedding",
                        "exec"
                    );
                    return Ok(embeddings);
                }
                Err((retryable, message)) => {
                    if !retryable {
                        anyhow::bail!("Embedding API error: {}", message);
                    }
                    last_error = message;
                    if attempt < MAX_ATTEMPTS {
                        warn!(
                            "Embedding attempt {}/{} failed: {}. Retrying...",
                            attempt, MAX_ATTEMPTS, last_error
                        );
                        tokio::time::sleep(Duration::from_millis(300 * u64::from(attempt))).await;
                    }
                }
            }
        }

        anyhow::bail!(
            "Embedding failed after {} attempts: {}",
            MAX_ATTEMPTS,
            last_error
        )
    }

    async fn send_once(
        &self,
        url: &str,
        request: &EmbeddingRequest,
    ) -> std::result::Result<Vec<Vec<f32>>, (bool, String)> {
        let mut builder = self.client.post(url);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| (true, format!("connect: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retryable = status.as_u16() == 429 || status.is_server_error();
            return Err((retryable, format!("{} - {}", status, body)));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| (true, format!("parse: {}", e)))?;

        if body.data.len() != request.input.len() {
            return Err((
                false,
                format!(
                    "provider returned {} embeddings for {} inputs",
                    body.data.len(),
                    request.input.len()
                ),
            ));
        }

        let mut data = body.data;
        data.sort_by_key(|d| d.index);

        for item in &data {
            if item.embedding.len() != self.dimension {
                return Err((
                    false,
                    format!(
                        "dimension mismatch: expected {}, got {}",
                        self.dimension,
                        item.embedding.len()
                    ),
                ));
            }
        }

        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;

    fn service() -> EmbeddingService {
        let limits = LimitsConfig {
            embedding_concurrency: 2,
            vector_search_concurrency: 2,
            db_concurrency: 2,
            llm_concurrency: 2,
            rerank_concurrency: 2,
            acquire_timeout_ms: 100,
        };
        EmbeddingService::new(
            EmbeddingConfig {
                base_url: "http://localhost:1".into(),
                api_key: None,
                model: "test-model".into(),
                dimension: 4,
                max_input_tokens: 50,
                batch_size: 8,
                cache_size: 16,
            },
            Arc::new(Limiters::new(&limits)),
            Arc::new(PerformanceMetrics::new()),
        )
    }

    #[test]
    fn test_cache_key_depends_on_model_and_text() {
        let svc = service();
        let a = svc.cache_key("masa berlaku visa");
        let b = svc.cache_key("masa berlaku visa ");
        assert_ne!(a, b);
        assert_eq!(a, svc.cache_key("masa berlaku visa"));
    }

    #[test]
    fn test_oversized_input_rejected_without_opt_in() {
        let svc = service();
        let long_text = "pasal ".repeat(200);
        let err = svc.prepare_input(long_text, false).unwrap_err();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn test_oversized_input_truncated_with_opt_in() {
        let svc = service();
        let long_text = "pasal ".repeat(200);
        let truncated = svc.prepare_input(long_text, true).unwrap();
        assert!(token_estimator::estimate_tokens(&truncated) <= 50);
    }

    #[tokio::test]
    async fn test_empty_batch_is_empty() {
        let svc = service();
        let result = svc.embed_batch(vec![], false).await.unwrap();
        assert!(result.is_empty());
    }
}

use crate::config::RerankConfig;
use crate::utils::limiters::Limiters;
use crate::utils::similarity::normalize_score;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: String,
    pub text: String,
    /// First-stage (ANN) similarity, already normalized into [0, 1].
    pub first_stage_score: f32,
}

/// Re-rank result: `(input index, score)` sorted by descending score. The
/// ranking is always a permutation of the input indices.
#[derive(Debug, Clone)]
pub struct RerankOutcome {
    pub ranking: Vec<(usize, f32)>,
    /// True when the early-exit policy skipped the model call.
    pub skipped: bool,
}

#[async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(&self, query: &str, candidates: &[RerankCandidate]) -> Result<RerankOutcome>;
}

/// Remote cross-encoder over a Jina/Cohere-style HTTP API.
pub struct RemoteReranker {
    client: Client,
    config: RerankConfig,
    early_exit_top_k: usize,
    limiters: Arc<Limiters>,
}

#[derive(Debug, Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Debug, Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

#[derive(Debug, Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

impl RemoteReranker {
    pub fn new(config: RerankConfig, early_exit_top_k: usize, limiters: Arc<Limiters>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_seconds))
                .build()
                .unwrap_or_else(|_| Client::new()),
            config,
            early_exit_top_k: early_exit_top_k.max(1),
            limiters,
        }
    }

    /// All of the current top-k already above the threshold: the first-stage
    /// ordering is good enough, skip the model call.
    fn should_skip(&self, candidates: &[RerankCandidate]) -> bool {
        let k = self.early_exit_top_k.min(candidates.len());
        if k == 0 {
            return true;
        }

        let mut scores: Vec<f32> = candidates.iter().map(|c| c.first_stage_score).collect();
        scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

        scores[..k]
            .iter()
            .all(|s| *s >= self.config.early_exit_threshold)
    }

    fn first_stage_ranking(candidates: &[RerankCandidate]) -> Vec<(usize, f32)> {
        let mut ranking: Vec<(usize, f32)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, c.first_stage_score))
            .collect();
        ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranking
    }
}

#[async_trait]
impl Reranker for RemoteReranker {
    async fn rerank(&self, query: &str, candidates: &[RerankCandidate]) -> Result<RerankOutcome> {
        if candidates.is_empty() {
            return Ok(RerankOutcome {
                ranking: Vec::new(),
                skipped: false,
            });
        }

        if !self.config.enabled {
            return Ok(RerankOutcome {
                ranking: Self::first_stage_ranking(candidates),
                skipped: true,
            });
        }

        if self.should_skip(candidates) {
            info!(
                "Re-rank early exit: top-{} already above {:.2}",
                self.early_exit_top_k, self.config.early_exit_threshold
            );
            return Ok(RerankOutcome {
                ranking: Self::first_stage_ranking(candidates),
                skipped: true,
            });
        }

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.rerank.clone(),
            self.limiters.acquire_timeout,
            "rerank",
        )
        .await?;
        debug!(wait_ms = wait.as_millis() as u64, op = "rerank", "wait_queue");

        let request = RerankRequest {
            model: &self.config.model,
            query,
            documents: candidates.iter().map(|c| c.text.as_str()).collect(),
            top_n: candidates.len(),
        };

        let url = format!("{}/v1/rerank", self.config.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(&url);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let response = builder
            .json(&request)
            .send()
            .await
            .context("Failed to reach rerank API")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Rerank API error ({}): {}", status, body);
        }

        let body: RerankResponse = response
            .json()
            .await
            .context("Failed to parse rerank response")?;

        let mut ranking: Vec<(usize, f32)> = body
            .results
            .into_iter()
            .filter(|r| r.index < candidates.len())
            .map(|r| (r.index, normalize_score(r.relevance_score)))
            .collect();

        // The API may drop indices; re-attach any missing candidate at the
        // tail with its first-stage score so the output stays a permutation.
        let mut seen = vec![false; candidates.len()];
        for (index, _) in &ranking {
            seen[*index] = true;
        }
        for (index, present) in seen.iter().enumerate() {
            if !present {
                ranking.push((index, candidates[index].first_stage_score));
            }
        }

        ranking.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(RerankOutcome {
            ranking,
            skipped: false,
        })
    }
}

/// Identity implementation used when re-ranking is disabled in tests.
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    async fn rerank(&self, _query: &str, candidates: &[RerankCandidate]) -> Result<RerankOutcome> {
        Ok(RerankOutcome {
            ranking: RemoteReranker::first_stage_ranking(candidates),
            skipped: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LimitsConfig;

    fn candidates(scores: &[f32]) -> Vec<RerankCandidate> {
        scores
            .iter()
            .enumerate()
            .map(|(i, s)| RerankCandidate {
                id: format!("c{}", i),
                text: format!("passage {}", i),
                first_stage_score: *s,
            })
            .collect()
    }

    fn reranker(enabled: bool, threshold: f32) -> RemoteReranker {
        let limits = LimitsConfig {
            embedding_concurrency: 1,
            vector_search_concurrency: 1,
            db_concurrency: 1,
            llm_concurrency: 1,
            rerank_concurrency: 1,
            acquire_timeout_ms: 100,
        };
        RemoteReranker::new(
            RerankConfig {
                enabled,
                base_url: "http://localhost:1".into(),
                api_key: None,
                model: "rerank-test".into(),
                early_exit_threshold: threshold,
                timeout_seconds: 1,
            },
            2,
            Arc::new(Limiters::new(&limits)),
        )
    }

    #[tokio::test]
    async fn test_early_exit_when_top_k_confident() {
        let reranker = reranker(true, 0.9);
        let outcome = reranker
            .rerank("query", &candidates(&[0.95, 0.93, 0.2]))
            .await
            .unwrap();

        assert!(outcome.skipped);
        assert_eq!(outcome.ranking[0].0, 0);
        assert_eq!(outcome.ranking[1].0, 1);
        assert_eq!(outcome.ranking[2].0, 2);
    }

    #[tokio::test]
    async fn test_disabled_reranker_keeps_first_stage_order() {
        let reranker = reranker(false, 0.9);
        let outcome = reranker
            .rerank("query", &candidates(&[0.1, 0.8, 0.5]))
            .await
            .unwrap();

        assert!(outcome.skipped);
        let order: Vec<usize> = outcome.ranking.iter().map(|(i, _)| *i).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_ranking_is_permutation() {
        let reranker = reranker(false, 0.9);
        let input = candidates(&[0.4, 0.9, 0.1, 0.7]);
        let outcome = reranker.rerank("query", &input).await.unwrap();

        let mut indices: Vec<usize> = outcome.ranking.iter().map(|(i, _)| *i).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let reranker = reranker(true, 0.9);
        let outcome = reranker.rerank("query", &[]).await.unwrap();
        assert!(outcome.ranking.is_empty());
    }
}

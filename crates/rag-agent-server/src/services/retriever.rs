use crate::config::{FeatureFlags, RagConfig};
use crate::database::{models::parent_key, Repository, RouteStore, Subgraph};
use crate::database::GraphStore;
use crate::metrics::PerformanceMetrics;
use crate::services::embedding_service::EmbeddingService;
use crate::services::reranker::{RerankCandidate, Reranker};
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;
use crate::vector::{Filter, ScoredPoint, VectorStore};
use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Hybrid retrieval: route the query across domain collections, fuse ANN
/// results with reciprocal-rank fusion, re-rank, then join every child hit
/// back to its parent chunk in the relational store.
pub struct HybridRetriever {
    embedding: Arc<EmbeddingService>,
    vector_store: Arc<VectorStore>,
    reranker: Arc<dyn Reranker>,
    repository: Arc<Repository>,
    graph: Arc<GraphStore>,
    routes: Arc<RouteStore>,
    limiters: Arc<Limiters>,
    metrics: Arc<PerformanceMetrics>,
    config: RagConfig,
    features: FeatureFlags,
    known_collections: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub top_k: usize,
    /// Override keyword routing with explicit collections.
    pub collections: Option<Vec<String>>,
    /// Access-tier filter applied at the vector store.
    pub tier: Option<String>,
    /// Override the graph-expansion feature flag for this call.
    pub graph_expansion: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct AncestorSection {
    pub hierarchy_path: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RetrievedPassage {
    pub child_id: String,
    pub document_id: String,
    pub hierarchy_path: String,
    /// Composite parent key, also the citation id.
    pub parent_key: String,
    pub child_text: String,
    pub parent_text: String,
    pub ancestors: Vec<AncestorSection>,
    pub collection: String,
    pub score: f32,
    pub tier: String,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalEnvelope {
    pub passages: Vec<RetrievedPassage>,
    pub route_used: String,
    pub route_cached: bool,
    pub rerank_skipped: bool,
    pub orphans_filtered: usize,
    pub subgraph: Option<Subgraph>,
}

static ROUTE_PATTERNS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "visa_oracle",
            Regex::new(r"(?i)\b(visa|kitas|kitap|voa|imigrasi|immigration|paspor|passport|stay permit|overstay|sponsor)\b").unwrap(),
        ),
        (
            "tax_genius",
            Regex::new(r"(?i)\b(pajak|tax|npwp|spt|pph|ppn|coretax|withholding|fiskal)\b").unwrap(),
        ),
        (
            "kbli_unified",
            Regex::new(r"(?i)\b(kbli|oss|nib|klasifikasi usaha|business classification|risk.based)\b").unwrap(),
        ),
    ]
});

/// Keyword routing over the domain collections. Falls back to the default
/// collection when nothing matches; a query may fan out to several.
pub fn route_collections(query: &str, known: &[String], default: &str) -> Vec<String> {
    let mut matched: Vec<String> = ROUTE_PATTERNS
        .iter()
        .filter(|(name, pattern)| {
            pattern.is_match(query) && known.iter().any(|k| k == name)
        })
        .map(|(name, _)| name.to_string())
        .collect();

    if matched.is_empty() {
        matched.push(default.to_string());
    }

    matched
}

/// Canonical fingerprint of a query for the golden-route cache.
pub fn query_fingerprint(query: &str) -> String {
    let normalized = query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Reciprocal-rank fusion across per-collection rankings. A point that shows
/// up in several lists accumulates 1/(k + rank) from each.
pub fn rrf_merge(rankings: &[Vec<ScoredPoint>], k: f32) -> Vec<(ScoredPoint, f32)> {
    let mut fused: HashMap<String, (ScoredPoint, f32)> = HashMap::new();

    for ranking in rankings {
        for (rank, point) in ranking.iter().enumerate() {
            let contribution = 1.0 / (k + rank as f32 + 1.0);
            fused
                .entry(point.id.clone())
                .and_modify(|(existing, score)| {
                    *score += contribution;
                    if point.score > existing.score {
                        existing.score = point.score;
                    }
                })
                .or_insert_with(|| (point.clone(), contribution));
        }
    }

    let mut merged: Vec<(ScoredPoint, f32)> = fused.into_values().collect();
    merged.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    merged
}

static ENTITY_MENTION: Lazy<Regex> = Lazy::new(|| {
    // Regulatory artifacts ("PP 31/2013", "UU No. 6 Tahun 2011") and common
    // entity markers; the rest of extraction happens against the graph table.
    Regex::new(r"(?i)\b(kitas|kitap|pt pma|npwp|rptka|(?:pp|uu|permenkumham|perpres)\s*(?:no\.?\s*)?\d+(?:\s*/\s*\d{4}|\s+tahun\s+\d{4})?)\b")
        .unwrap()
});

pub fn extract_entity_mentions(texts: &[&str], limit: usize) -> Vec<String> {
    let mut mentions: Vec<String> = Vec::new();

    for text in texts {
        for capture in ENTITY_MENTION.find_iter(text) {
            let mention = capture.as_str().trim().to_lowercase();
            if !mentions.contains(&mention) {
                mentions.push(mention);
            }
            if mentions.len() >= limit {
                return mentions;
            }
        }
    }

    mentions
}

impl HybridRetriever {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        embedding: Arc<EmbeddingService>,
        vector_store: Arc<VectorStore>,
        reranker: Arc<dyn Reranker>,
        repository: Arc<Repository>,
        graph: Arc<GraphStore>,
        routes: Arc<RouteStore>,
        limiters: Arc<Limiters>,
        metrics: Arc<PerformanceMetrics>,
        config: RagConfig,
        features: FeatureFlags,
        known_collections: Vec<String>,
    ) -> Self {
        Self {
            embedding,
            vector_store,
            reranker,
            repository,
            graph,
            routes,
            limiters,
            metrics,
            config,
            features,
            known_collections,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<RetrievalEnvelope, ApiError> {
        if query.trim().is_empty() {
            return Err(ApiError::BadRequest("Query cannot be empty".to_string()));
        }

        if opts.top_k == 0 {
            return Ok(RetrievalEnvelope {
                route_used: "none".to_string(),
                ..Default::default()
            });
        }

        let collections = opts.collections.clone().unwrap_or_else(|| {
            route_collections(query, &self.known_collections, &self.config.default_collection)
        });
        let route_used = collections.join("+");

        let query_embedding = tokio::time::timeout(
            Duration::from_secs(10),
            self.embedding.embed(query),
        )
        .await
        .map_err(|_| ApiError::EmbeddingError("Embedding generation timeout".to_string()))??;

        // Golden-route fast path: a recurring query skips ANN entirely.
        if self.features.enable_golden_route_cache {
            if let Some(envelope) = self
                .try_golden_route(&query_embedding, &route_used)
                .await?
            {
                return Ok(envelope);
            }
        }

        let rankings = self
            .search_collections(&collections, &query_embedding, opts)
            .await?;

        // Provenance: first collection that surfaced a point wins the tag.
        let mut point_collections: HashMap<String, String> = HashMap::new();
        for (collection, ranking) in collections.iter().zip(&rankings) {
            for point in ranking {
                point_collections
                    .entry(point.id.clone())
                    .or_insert_with(|| collection.clone());
            }
        }

        let fused = rrf_merge(&rankings, self.config.rrf_k);

        if fused.is_empty() {
            return Ok(RetrievalEnvelope {
                route_used,
                ..Default::default()
            });
        }

        // Second stage: cross-encoder ordering over the fused candidates.
        let candidates: Vec<RerankCandidate> = fused
            .iter()
            .map(|(point, _)| RerankCandidate {
                id: point.id.clone(),
                text: point.payload.text.clone(),
                first_stage_score: point.score,
            })
            .collect();

        let rerank_start = Instant::now();
        let outcome = self
            .reranker
            .rerank(query, &candidates)
            .await
            .map_err(|e| ApiError::RetrievalError(format!("Rerank failed: {}", e)))?;
        debug!(
            exec_ms = rerank_start.elapsed().as_millis() as u64,
            skipped = outcome.skipped,
            op = "rerank",
            "exec"
        );
        if outcome.skipped {
            self.metrics
                .rerank_early_exits
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        let ordered: Vec<(ScoredPoint, f32)> = outcome
            .ranking
            .iter()
            .map(|(index, score)| (fused[*index].0.clone(), *score))
            .collect();

        let mut envelope = self
            .join_parents(ordered, opts.top_k, &route_used, &point_collections)
            .await?;
        envelope.rerank_skipped = outcome.skipped;

        let expand = opts
            .graph_expansion
            .unwrap_or(self.features.enable_graph_expansion);
        if expand && !envelope.passages.is_empty() {
            envelope.subgraph = self.expand_graph(&envelope).await;
        }

        Ok(envelope)
    }

    async fn try_golden_route(
        &self,
        query_embedding: &[f32],
        route_used: &str,
    ) -> Result<Option<RetrievalEnvelope>, ApiError> {
        let nearest = self
            .routes
            .nearest(query_embedding)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        let Some((route, similarity)) = nearest else {
            return Ok(None);
        };

        if similarity < self.config.golden_route_threshold {
            return Ok(None);
        }

        let parents = self
            .repository
            .get_parents_by_keys(&route.parent_keys.0)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        if parents.is_empty() {
            warn!("Golden route {} resolved to no parents, ignoring", route.id);
            return Ok(None);
        }

        if let Err(e) = self.routes.record_hit(route.id).await {
            warn!("Failed to record golden route hit: {}", e);
        }
        self.metrics
            .golden_route_hits
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        info!(
            "Golden route hit (similarity {:.3}) for '{}'",
            similarity, route.query_text
        );

        let passages = parents
            .into_iter()
            .map(|parent| RetrievedPassage {
                child_id: String::new(),
                document_id: parent.document_id.clone(),
                hierarchy_path: parent.hierarchy_path.clone(),
                parent_key: parent.key(),
                child_text: parent.full_text.clone(),
                parent_text: parent.full_text,
                ancestors: Vec::new(),
                collection: route.collection.clone(),
                score: similarity,
                tier: "public".to_string(),
            })
            .collect();

        Ok(Some(RetrievalEnvelope {
            passages,
            route_used: route_used.to_string(),
            route_cached: true,
            ..Default::default()
        }))
    }

    async fn search_collections(
        &self,
        collections: &[String],
        query_embedding: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<Vec<ScoredPoint>>, ApiError> {
        let filter = opts
            .tier
            .as_ref()
            .map(|tier| Filter::new().eq("tier", tier.as_str()));

        let (_permit, wait) = Limiters::acquire_timed(
            self.limiters.vector_search.clone(),
            self.limiters.acquire_timeout,
            "vector_search",
        )
        .await
        .map_err(|e| {
            self.metrics
                .limiter_timeouts
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            ApiError::RetrievalError(e.to_string())
        })?;
        debug!(wait_ms = wait.as_millis() as u64, op = "vector_search", "wait_queue");

        let mut rankings = Vec::with_capacity(collections.len());
        for collection in collections {
            let hits = self
                .vector_store
                .search(collection, query_embedding, opts.top_k, filter.as_ref())
                .await
                .map_err(|e| ApiError::RetrievalError(e.to_string()))?;
            rankings.push(hits);
        }

        Ok(rankings)
    }

    /// Join child hits to their parents, dropping orphans with a warning.
    /// The envelope never carries more than `limit` passages.
    async fn join_parents(
        &self,
        ordered: Vec<(ScoredPoint, f32)>,
        limit: usize,
        route_used: &str,
        point_collections: &HashMap<String, String>,
    ) -> Result<RetrievalEnvelope, ApiError> {
        let keys: Vec<String> = ordered
            .iter()
            .filter_map(|(point, _)| point.payload.parent_chunk_ids.first().cloned())
            .collect();

        let parents = self
            .repository
            .get_parents_by_keys(&keys)
            .await
            .map_err(|e| ApiError::RetrievalError(e.to_string()))?;

        let by_key: HashMap<String, _> = parents
            .into_iter()
            .map(|parent| (parent.key(), parent))
            .collect();

        let mut envelope = RetrievalEnvelope {
            route_used: route_used.to_string(),
            ..Default::default()
        };

        for (point, score) in ordered {
            if envelope.passages.len() >= limit {
                break;
            }

            let Some(key) = point.payload.parent_chunk_ids.first() else {
                warn!("Child {} carries no parent key, dropping", point.id);
                envelope.orphans_filtered += 1;
                continue;
            };

            let Some(parent) = by_key.get(key) else {
                warn!("Orphan child {} (parent {} missing), dropping", point.id, key);
                envelope.orphans_filtered += 1;
                self.metrics
                    .orphan_children_filtered
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                continue;
            };

            let ancestors = self.load_ancestors(parent).await;
            let collection = point_collections
                .get(&point.id)
                .cloned()
                .unwrap_or_else(|| route_used.to_string());

            envelope.passages.push(RetrievedPassage {
                child_id: point.id,
                document_id: point.payload.document_id,
                hierarchy_path: point.payload.hierarchy_path,
                parent_key: key.clone(),
                child_text: point.payload.text,
                parent_text: parent.full_text.clone(),
                ancestors,
                collection,
                score,
                tier: point.payload.tier,
            });
        }

        Ok(envelope)
    }

    async fn load_ancestors(
        &self,
        parent: &crate::database::ParentChunk,
    ) -> Vec<AncestorSection> {
        if self.config.parent_ancestor_depth == 0 || parent.parent_path.is_none() {
            return Vec::new();
        }

        let chain = match self
            .repository
            .get_full_text(&parent.key(), self.config.parent_ancestor_depth)
            .await
        {
            Ok(chain) => chain,
            Err(e) => {
                warn!("Failed to load ancestors for {}: {}", parent.key(), e);
                return Vec::new();
            }
        };

        chain
            .into_iter()
            .filter(|p| p.hierarchy_path != parent.hierarchy_path)
            .map(|p| AncestorSection {
                hierarchy_path: p.hierarchy_path,
                // Ancestors are context, not evidence; summaries beat walls of text.
                text: p.summary.unwrap_or_else(|| {
                    p.full_text.chars().take(500).collect::<String>()
                }),
            })
            .collect()
    }

    async fn expand_graph(&self, envelope: &RetrievalEnvelope) -> Option<Subgraph> {
        let texts: Vec<&str> = envelope
            .passages
            .iter()
            .take(3)
            .map(|p| p.child_text.as_str())
            .collect();

        let mentions = extract_entity_mentions(&texts, 3);
        if mentions.is_empty() {
            return None;
        }

        let mut merged = Subgraph::default();
        for mention in mentions {
            let candidates = match self.graph.find_entity_by_name(&mention, 1).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("Graph lookup failed for '{}': {}", mention, e);
                    continue;
                }
            };

            let Some(entity) = candidates.into_iter().next() else {
                continue;
            };

            match self
                .graph
                .traverse(&entity.id, self.config.graph_expansion_depth)
                .await
            {
                Ok(subgraph) => {
                    for node in subgraph.nodes {
                        if !merged.nodes.iter().any(|n| n.id == node.id) {
                            merged.nodes.push(node);
                        }
                    }
                    for edge in subgraph.edges {
                        if !merged.edges.iter().any(|e| {
                            e.source_id == edge.source_id
                                && e.target_id == edge.target_id
                                && e.rel_type == edge.rel_type
                        }) {
                            merged.edges.push(edge);
                        }
                    }
                }
                Err(e) => warn!("Graph traversal failed for '{}': {}", entity.id, e),
            }
        }

        if merged.nodes.is_empty() {
            None
        } else {
            Some(merged)
        }
    }

    /// Store a resolved route so recurring queries can bypass retrieval.
    pub async fn record_golden_route(
        &self,
        query: &str,
        envelope: &RetrievalEnvelope,
    ) -> Result<()> {
        if !self.features.enable_golden_route_cache
            || envelope.route_cached
            || envelope.passages.is_empty()
        {
            return Ok(());
        }

        let embedding = self.embedding.embed(query).await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        let parent_keys: Vec<String> = envelope
            .passages
            .iter()
            .map(|p| parent_key(&p.document_id, &p.hierarchy_path))
            .collect();

        self.routes
            .upsert(
                &query_fingerprint(query),
                query,
                &embedding,
                &parent_keys,
                &envelope.route_used,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::ChildPayload;

    fn point(id: &str, score: f32) -> ScoredPoint {
        ScoredPoint {
            id: id.to_string(),
            score,
            payload: ChildPayload {
                document_id: "PP_31_2013".into(),
                parent_chunk_ids: vec!["PP_31_2013:BAB_I".into()],
                hierarchy_path: "BAB_I".into(),
                text: format!("text {}", id),
                tier: "public".into(),
                language: "id".into(),
                chunk_index: 0,
                fingerprint: "f".into(),
                drive_link: None,
            },
        }
    }

    fn known() -> Vec<String> {
        vec![
            "visa_oracle".into(),
            "tax_genius".into(),
            "legal_unified".into(),
            "kbli_unified".into(),
        ]
    }

    #[test]
    fn test_route_visa_queries() {
        let collections = route_collections(
            "Apa syarat investor KITAS?",
            &known(),
            "legal_unified",
        );
        assert_eq!(collections, vec!["visa_oracle".to_string()]);
    }

    #[test]
    fn test_route_tax_queries() {
        let collections = route_collections("How do I file my SPT with coretax?", &known(), "legal_unified");
        assert_eq!(collections, vec!["tax_genius".to_string()]);
    }

    #[test]
    fn test_route_defaults_to_legal() {
        let collections =
            route_collections("Apa masa berlaku PP 31/2013?", &known(), "legal_unified");
        assert_eq!(collections, vec!["legal_unified".to_string()]);
    }

    #[test]
    fn test_route_can_fan_out() {
        let collections = route_collections(
            "Pajak untuk pemegang KITAS investor",
            &known(),
            "legal_unified",
        );
        assert!(collections.contains(&"visa_oracle".to_string()));
        assert!(collections.contains(&"tax_genius".to_string()));
    }

    #[test]
    fn test_rrf_prefers_items_in_both_lists() {
        let list_a = vec![point("a", 0.9), point("b", 0.8)];
        let list_b = vec![point("b", 0.7), point("c", 0.6)];

        let merged = rrf_merge(&[list_a, list_b], 60.0);
        assert_eq!(merged[0].0.id, "b");
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_rrf_keeps_best_ann_score() {
        let list_a = vec![point("a", 0.4)];
        let list_b = vec![point("a", 0.9)];

        let merged = rrf_merge(&[list_a, list_b], 60.0);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].0.score - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_query_fingerprint_normalizes_whitespace_and_case() {
        assert_eq!(
            query_fingerprint("Masa  berlaku   PP 31/2013"),
            query_fingerprint("masa berlaku pp 31/2013")
        );
        assert_ne!(
            query_fingerprint("masa berlaku pp 31/2013"),
            query_fingerprint("masa berlaku pp 31/2014")
        );
    }

    #[test]
    fn test_extract_entity_mentions() {
        let texts = ["Pemegang Investor KITAS wajib memiliki NPWP sesuai PP 31/2013."];
        let mentions = extract_entity_mentions(&texts, 5);
        assert!(mentions.contains(&"kitas".to_string()));
        assert!(mentions.contains(&"npwp".to_string()));
        assert!(mentions.iter().any(|m| m.starts_with("pp")));
    }

    #[test]
    fn test_extract_entity_mentions_respects_limit() {
        let texts = ["KITAS KITAP NPWP RPTKA PT PMA"];
        let mentions = extract_entity_mentions(&texts, 2);
        assert_eq!(mentions.len(), 2);
    }
}

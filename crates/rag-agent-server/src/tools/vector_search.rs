use super::{Tool, ToolError, ToolOutput};
use crate::models::chat::SourceInfo;
use crate::services::retriever::{HybridRetriever, RetrievalEnvelope, SearchOptions};
use crate::utils::token_estimator;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// Ranked passage retrieval over the hybrid store. Fresh, non-empty results
/// are recorded into the golden-route cache in the background.
pub struct VectorSearchTool {
    retriever: Arc<HybridRetriever>,
    default_top_k: usize,
    max_context_tokens: usize,
}

impl VectorSearchTool {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        default_top_k: usize,
        max_context_tokens: usize,
    ) -> Self {
        Self {
            retriever,
            default_top_k,
            max_context_tokens: max_context_tokens.max(500),
        }
    }
}

/// Render the envelope into a model-facing observation plus the citation
/// sources for the passages that actually made it in. Token-bounded: stops
/// appending once the budget is hit rather than handing the model a context
/// it cannot fit.
fn build_observation(
    envelope: &RetrievalEnvelope,
    max_context_tokens: usize,
) -> (String, Vec<SourceInfo>, bool) {
    let mut observation = format!(
        "Found {} passages (route: {}{}):\n\n",
        envelope.passages.len(),
        envelope.route_used,
        if envelope.route_cached { ", cached" } else { "" }
    );

    let mut current_tokens = token_estimator::estimate_tokens(&observation);
    let mut truncated = false;

    let mut sources = Vec::new();
    for passage in &envelope.passages {
        let block = format!(
            "[{}] (score {:.3})\n{}\n\n",
            passage.parent_key,
            passage.score,
            passage.parent_text.chars().take(1200).collect::<String>()
        );

        let block_tokens = token_estimator::estimate_tokens(&block);
        if current_tokens + block_tokens > max_context_tokens {
            truncated = true;
            break;
        }
        current_tokens += block_tokens;
        observation.push_str(&block);

        sources.push(SourceInfo {
            passage_id: passage.parent_key.clone(),
            document_id: passage.document_id.clone(),
            hierarchy_path: passage.hierarchy_path.clone(),
            collection: passage.collection.clone(),
            score: passage.score,
            preview: passage.child_text.chars().take(150).collect(),
        });
    }

    if truncated {
        observation.push_str("(further passages omitted to fit the context budget)\n");
    }

    if let Some(subgraph) = &envelope.subgraph {
        observation.push_str("Related knowledge graph:\n");
        let node_names: std::collections::HashMap<&str, &str> = subgraph
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), n.name.as_str()))
            .collect();
        for edge in &subgraph.edges {
            observation.push_str(&format!(
                "- {} [{}] -> {}\n",
                node_names
                    .get(edge.source_id.as_str())
                    .unwrap_or(&edge.source_id.as_str()),
                edge.rel_type,
                node_names
                    .get(edge.target_id.as_str())
                    .unwrap_or(&edge.target_id.as_str()),
            ));
        }
    }

    (observation, sources, truncated)
}

#[async_trait]
impl Tool for VectorSearchTool {
    fn name(&self) -> &'static str {
        "vector_search"
    }

    fn description(&self) -> &'static str {
        "Search Indonesian legal and regulatory knowledge (laws, visa rules, tax rules, \
         KBLI classifications). Returns ranked passages with citation ids. Use a focused \
         natural-language query."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural-language search query"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Number of passages to return (default 5)"
                },
                "collection": {
                    "type": "string",
                    "description": "Pin a specific collection (visa_oracle, tax_genius, legal_unified, kbli_unified)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let query = args["query"].as_str().unwrap_or_default();
        let top_k = args["top_k"]
            .as_u64()
            .map(|k| k as usize)
            .unwrap_or(self.default_top_k);
        let collections = args["collection"]
            .as_str()
            .map(|c| vec![c.to_string()]);

        let opts = SearchOptions {
            top_k,
            collections,
            ..Default::default()
        };

        let envelope = self
            .retriever
            .search(query, &opts)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        if envelope.passages.is_empty() {
            return Ok(ToolOutput::text(format!(
                "No passages found for '{}' in {}.",
                query, envelope.route_used
            )));
        }

        let (observation, sources, _truncated) =
            build_observation(&envelope, self.max_context_tokens);

        // Remember the resolved route for recurring queries.
        {
            let retriever = self.retriever.clone();
            let query = query.to_string();
            let envelope_for_route = envelope.clone();
            tokio::spawn(async move {
                if let Err(e) = retriever
                    .record_golden_route(&query, &envelope_for_route)
                    .await
                {
                    tracing::debug!("Golden route record skipped: {}", e);
                }
            });
        }

        Ok(ToolOutput {
            observation,
            sources,
            route_used: Some(envelope.route_used.clone()),
            route_cached: envelope.route_cached,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{KgEntity, KgRelationship, Subgraph};
    use crate::services::retriever::RetrievedPassage;

    fn passage(key: &str, text: &str, score: f32) -> RetrievedPassage {
        RetrievedPassage {
            child_id: format!("child-{}", key),
            document_id: "PP_31_2013".into(),
            hierarchy_path: key.into(),
            parent_key: format!("PP_31_2013:{}", key),
            child_text: text.into(),
            parent_text: text.into(),
            ancestors: Vec::new(),
            collection: "legal_unified".into(),
            score,
            tier: "public".into(),
        }
    }

    fn envelope(passages: Vec<RetrievedPassage>) -> RetrievalEnvelope {
        RetrievalEnvelope {
            passages,
            route_used: "legal_unified".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_observation_carries_citations_and_sources() {
        let envelope = envelope(vec![
            passage("BAB_I", "Ketentuan umum.", 0.91),
            passage("BAB_II/Pasal_5", "Masa berlaku lima tahun.", 0.88),
        ]);

        let (observation, sources, truncated) = build_observation(&envelope, 10_000);

        assert!(!truncated);
        assert!(observation.contains("[PP_31_2013:BAB_I]"));
        assert!(observation.contains("[PP_31_2013:BAB_II/Pasal_5]"));
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[1].passage_id, "PP_31_2013:BAB_II/Pasal_5");
        assert_eq!(sources[1].document_id, "PP_31_2013");
    }

    #[test]
    fn test_token_budget_cuts_the_tail() {
        let long_text = "pasal ".repeat(400);
        let envelope = envelope(vec![
            passage("BAB_I", &long_text, 0.9),
            passage("BAB_II", &long_text, 0.8),
            passage("BAB_III", &long_text, 0.7),
        ]);

        // Budget fits roughly one passage block.
        let (observation, sources, truncated) = build_observation(&envelope, 600);

        assert!(truncated);
        assert!(sources.len() < 3);
        assert!(observation.contains("omitted to fit the context budget"));
        // Sources stay aligned with what the observation actually contains.
        for source in &sources {
            assert!(observation.contains(&format!("[{}]", source.passage_id)));
        }
    }

    #[test]
    fn test_route_cached_is_visible_in_header() {
        let mut env = envelope(vec![passage("BAB_I", "Isi.", 1.0)]);
        env.route_cached = true;

        let (observation, _, _) = build_observation(&env, 10_000);
        assert!(observation.starts_with("Found 1 passages (route: legal_unified, cached)"));
    }

    #[test]
    fn test_subgraph_rendered_with_names_and_raw_id_fallback() {
        let mut env = envelope(vec![passage("BAB_I", "Isi.", 1.0)]);
        env.subgraph = Some(Subgraph {
            nodes: vec![KgEntity {
                id: "investor_kitas".into(),
                entity_type: "VISA".into(),
                name: "Investor KITAS".into(),
                description: None,
            }],
            edges: vec![KgRelationship {
                source_id: "investor_kitas".into(),
                // Dangling endpoint: no node row, must fall back to the id.
                target_id: "pt_pma".into(),
                rel_type: "REQUIRES".into(),
                strength: Some(0.9),
            }],
        });

        let (observation, _, _) = build_observation(&env, 10_000);
        assert!(observation.contains("Related knowledge graph:"));
        assert!(observation.contains("- Investor KITAS [REQUIRES] -> pt_pma"));
    }
}

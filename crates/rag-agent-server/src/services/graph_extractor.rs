use crate::database::{KgEntity, KgRelationship, ENTITY_TYPES, RELATIONSHIP_TYPES};
use crate::llm::{extract_first_json_object, GenerationRequest, LlmGateway};
use crate::models::chat::ChatMessage;
use anyhow::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// LLM-backed extraction of knowledge-graph elements from legal text.
/// Feeds the scheduled graph-build sweep; never called on the request path.
pub struct GraphExtractor {
    gateway: Arc<LlmGateway>,
}

#[derive(Debug, Default)]
pub struct ExtractedGraph {
    pub entities: Vec<KgEntity>,
    pub relationships: Vec<KgRelationship>,
}

#[derive(Debug, Deserialize)]
struct WireGraph {
    #[serde(default)]
    entities: Vec<WireEntity>,
    #[serde(default, alias = "relations")]
    relationships: Vec<WireRelationship>,
}

#[derive(Debug, Deserialize)]
struct WireEntity {
    id: String,
    #[serde(rename = "type")]
    entity_type: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireRelationship {
    source: String,
    target: String,
    #[serde(rename = "type")]
    rel_type: String,
    #[serde(default)]
    strength: Option<f32>,
}

const MAX_TEXT_CHARS: usize = 4000;

impl GraphExtractor {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self { gateway }
    }

    pub async fn extract(&self, text: &str, context: &str) -> Result<ExtractedGraph> {
        let system_prompt = format!(
            "You are a legal knowledge graph architect for Indonesian law. Extract \
             structural relationships from the provided legal text.\n\n\
             Entities, allowed types: {}.\n\
             Format: {{\"id\": \"unique_snake_case_id\", \"type\": \"TYPE\", \
             \"name\": \"Natural Name\", \"description\": \"Context\"}}\n\n\
             Relationships, allowed types: {}.\n\
             Format: {{\"source\": \"source_id\", \"target\": \"target_id\", \
             \"type\": \"TYPE\", \"strength\": 0.0-1.0}}\n\n\
             Rules:\n\
             1. IDs must be unique, lowercase, snake_case (e.g. \"pp_31_2013\").\n\
             2. Be precise. Do not invent relationships that are not in the text.\n\
             3. Output MUST be valid JSON only: \
             {{\"entities\": [...], \"relationships\": [...]}}",
            ENTITY_TYPES.join(", "),
            RELATIONSHIP_TYPES.join(", ")
        );

        let excerpt: String = text.chars().take(MAX_TEXT_CHARS).collect();
        let request = GenerationRequest {
            max_tokens: Some(1024),
            temperature: Some(0.0),
            ..GenerationRequest::new(
                system_prompt,
                vec![ChatMessage::user(format!(
                    "Context: {}\n\nText to analyze:\n\"{}\"\n\nExtract the knowledge graph JSON.",
                    context, excerpt
                ))],
            )
        };

        let generation = self
            .gateway
            .generate(&request)
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        Ok(Self::parse_graph(&generation.text))
    }

    /// Parse and sanitize the model output: invalid types, malformed ids and
    /// dangling strengths are dropped rather than poisoning the graph.
    pub fn parse_graph(text: &str) -> ExtractedGraph {
        let Some(json_str) = extract_first_json_object(text) else {
            warn!("Graph extractor returned no JSON");
            return ExtractedGraph::default();
        };

        let Ok(wire) = serde_json::from_str::<WireGraph>(json_str) else {
            warn!("Graph extractor JSON malformed");
            return ExtractedGraph::default();
        };

        let entities: Vec<KgEntity> = wire
            .entities
            .into_iter()
            .filter(|e| {
                let valid_type = ENTITY_TYPES.contains(&e.entity_type.as_str());
                let valid_id = is_snake_case(&e.id);
                if !valid_type || !valid_id {
                    debug!("Dropping entity '{}' (type '{}')", e.id, e.entity_type);
                }
                valid_type && valid_id
            })
            .map(|e| KgEntity {
                id: e.id,
                entity_type: e.entity_type,
                name: e.name,
                description: e.description,
            })
            .collect();

        let relationships = wire
            .relationships
            .into_iter()
            .filter(|r| RELATIONSHIP_TYPES.contains(&r.rel_type.as_str()))
            .map(|r| KgRelationship {
                source_id: r.source,
                target_id: r.target,
                rel_type: r.rel_type,
                strength: r.strength.map(|s| s.clamp(0.0, 1.0)),
            })
            .collect();

        ExtractedGraph {
            entities,
            relationships,
        }
    }
}

fn is_snake_case(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_graph() {
        let output = r#"{"entities": [
            {"id": "investor_kitas_e28a", "type": "VISA", "name": "Investor KITAS E28A"},
            {"id": "pt_pma", "type": "REQUIREMENT", "name": "PT PMA shareholding"}
        ], "relationships": [
            {"source": "investor_kitas_e28a", "target": "pt_pma", "type": "REQUIRES", "strength": 0.9}
        ]}"#;

        let graph = GraphExtractor::parse_graph(output);
        assert_eq!(graph.entities.len(), 2);
        assert_eq!(graph.relationships.len(), 1);
        assert_eq!(graph.relationships[0].rel_type, "REQUIRES");
    }

    #[test]
    fn test_invalid_entity_types_dropped() {
        let output = r#"{"entities": [
            {"id": "thing", "type": "GADGET", "name": "Thing"},
            {"id": "imigrasi", "type": "AGENCY", "name": "Direktorat Jenderal Imigrasi"}
        ], "relationships": []}"#;

        let graph = GraphExtractor::parse_graph(output);
        assert_eq!(graph.entities.len(), 1);
        assert_eq!(graph.entities[0].id, "imigrasi");
    }

    #[test]
    fn test_non_snake_case_ids_dropped() {
        let output = r#"{"entities": [
            {"id": "Investor KITAS", "type": "VISA", "name": "Investor KITAS"}
        ], "relationships": []}"#;

        let graph = GraphExtractor::parse_graph(output);
        assert!(graph.entities.is_empty());
    }

    #[test]
    fn test_strength_clamped() {
        let output = r#"{"entities": [], "relationships": [
            {"source": "a", "target": "b", "type": "REQUIRES", "strength": 1.8}
        ]}"#;

        let graph = GraphExtractor::parse_graph(output);
        assert_eq!(graph.relationships[0].strength, Some(1.0));
    }

    #[test]
    fn test_noise_around_json_tolerated() {
        let output = "Here is the graph:\n{\"entities\": [], \"relationships\": []}\nDone.";
        let graph = GraphExtractor::parse_graph(output);
        assert!(graph.entities.is_empty());
        assert!(graph.relationships.is_empty());
    }

    #[test]
    fn test_garbage_yields_empty_graph() {
        let graph = GraphExtractor::parse_graph("no json at all");
        assert!(graph.entities.is_empty());
    }
}

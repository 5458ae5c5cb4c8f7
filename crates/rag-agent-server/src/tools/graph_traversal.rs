use super::{Tool, ToolError, ToolOutput};
use crate::database::{GraphStore, KgEntity, Subgraph};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Explore the legal knowledge graph for precise relationships (requirements,
/// costs, issuing agencies) that vector search tends to miss.
pub struct GraphTraversalTool {
    graph: Arc<GraphStore>,
}

impl GraphTraversalTool {
    pub fn new(graph: Arc<GraphStore>) -> Self {
        Self { graph }
    }
}

fn entity_not_found(entity_name: &str) -> String {
    format!(
        "No entity found in the knowledge graph matching '{}'. Try a broader term.",
        entity_name
    )
}

/// Textual subgraph summary with typed edge labels, readable by the model
/// without further calls. Edge endpoints missing from the node list render
/// as their raw ids rather than being dropped.
fn summarize_subgraph(start: &KgEntity, subgraph: &Subgraph) -> String {
    let node_names: HashMap<&str, &str> = subgraph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.name.as_str()))
        .collect();

    let mut summary = format!("Found entity: {} ({})\n", start.name, start.entity_type);
    if let Some(description) = &start.description {
        summary.push_str(&format!("{}\n", description));
    }
    summary.push_str(&format!("Relationships ({}):\n", subgraph.edges.len()));

    for edge in &subgraph.edges {
        let source_id_str = edge.source_id.as_str();
        let target_id_str = edge.target_id.as_str();
        let source = node_names.get(edge.source_id.as_str()).unwrap_or(&source_id_str);
        let target = node_names.get(edge.target_id.as_str()).unwrap_or(&target_id_str);
        summary.push_str(&format!("- {} [{}] -> {}\n", source, edge.rel_type, target));
    }

    if subgraph.edges.is_empty() {
        summary.push_str("(no relationships recorded yet)\n");
    }

    summary
}

#[async_trait]
impl Tool for GraphTraversalTool {
    fn name(&self) -> &'static str {
        "graph_traversal"
    }

    fn description(&self) -> &'static str {
        "Explore the legal knowledge graph. Use this to find precise relationships like \
         prerequisites, costs, or dependencies between entities (e.g. 'What does investor \
         KITAS require?'). Input an entity name such as 'investor kitas' or 'PT PMA'."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "entity_name": {
                    "type": "string",
                    "description": "Name of the entity to explore (e.g. 'PT PMA', 'Investor KITAS')"
                },
                "depth": {
                    "type": "integer",
                    "description": "Traversal depth (default 1, max 3)"
                }
            },
            "required": ["entity_name"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let entity_name = args["entity_name"].as_str().unwrap_or_default();
        let depth = args["depth"].as_u64().unwrap_or(1) as usize;

        let candidates = self
            .graph
            .find_entity_by_name(entity_name, 1)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        let Some(start) = candidates.into_iter().next() else {
            return Ok(ToolOutput::text(entity_not_found(entity_name)));
        };

        let subgraph = self
            .graph
            .traverse(&start.id, depth)
            .await
            .map_err(|e| ToolError::Failed(e.to_string()))?;

        Ok(ToolOutput::text(summarize_subgraph(&start, &subgraph)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::KgRelationship;

    fn entity(id: &str, name: &str, entity_type: &str) -> KgEntity {
        KgEntity {
            id: id.into(),
            entity_type: entity_type.into(),
            name: name.into(),
            description: None,
        }
    }

    fn edge(source: &str, target: &str, rel_type: &str) -> KgRelationship {
        KgRelationship {
            source_id: source.into(),
            target_id: target.into(),
            rel_type: rel_type.into(),
            strength: Some(0.9),
        }
    }

    #[test]
    fn test_summary_lists_typed_edges_with_names() {
        let start = entity("investor_kitas", "Investor KITAS", "VISA");
        let subgraph = Subgraph {
            nodes: vec![
                start.clone(),
                entity("pt_pma", "PT PMA shareholding", "REQUIREMENT"),
            ],
            edges: vec![edge("investor_kitas", "pt_pma", "REQUIRES")],
        };

        let summary = summarize_subgraph(&start, &subgraph);
        assert!(summary.starts_with("Found entity: Investor KITAS (VISA)"));
        assert!(summary.contains("Relationships (1):"));
        assert!(summary.contains("- Investor KITAS [REQUIRES] -> PT PMA shareholding"));
    }

    #[test]
    fn test_dangling_edge_falls_back_to_raw_id() {
        let start = entity("investor_kitas", "Investor KITAS", "VISA");
        let subgraph = Subgraph {
            nodes: vec![start.clone()],
            // Target id has no node row in this subgraph.
            edges: vec![edge("investor_kitas", "imigrasi", "ISSUED_BY")],
        };

        let summary = summarize_subgraph(&start, &subgraph);
        assert!(summary.contains("- Investor KITAS [ISSUED_BY] -> imigrasi"));
    }

    #[test]
    fn test_empty_subgraph_notes_missing_relationships() {
        let start = entity("coretax", "Coretax", "REGULATION");
        let summary = summarize_subgraph(&start, &Subgraph::default());
        assert!(summary.contains("Relationships (0):"));
        assert!(summary.contains("(no relationships recorded yet)"));
    }

    #[test]
    fn test_description_included_when_present() {
        let mut start = entity("rptka", "RPTKA", "PERMIT");
        start.description = Some("Foreign worker utilization plan.".into());

        let summary = summarize_subgraph(&start, &Subgraph::default());
        assert!(summary.contains("Foreign worker utilization plan."));
    }

    #[test]
    fn test_not_found_message_names_the_query() {
        let message = entity_not_found("yacht permit");
        assert!(message.contains("'yacht permit'"));
        assert!(message.contains("broader term"));
    }
}

use super::{DbPool, KgEntity, KgRelationship, Subgraph, ENTITY_TYPES, RELATIONSHIP_TYPES};
use anyhow::Result;
use std::collections::HashSet;
use tracing::debug;

/// Knowledge graph over `kg_entities` and `kg_relationships`. Relationship
/// endpoints must exist; `(source, target, type)` triples are unique.
pub struct GraphStore {
    pool: DbPool,
}

pub const MAX_TRAVERSAL_DEPTH: usize = 3;

impl GraphStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert or update an entity. Duplicate detection is case-insensitive
    /// name plus type, so "Investor KITAS" and "investor kitas" collapse.
    pub async fn upsert_entity(&self, entity: &KgEntity) -> Result<String> {
        if !ENTITY_TYPES.contains(&entity.entity_type.as_str()) {
            anyhow::bail!("Unknown entity type '{}'", entity.entity_type);
        }

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT id FROM kg_entities WHERE LOWER(name) = LOWER($1) AND entity_type = $2",
        )
        .bind(&entity.name)
        .bind(&entity.entity_type)
        .fetch_optional(self.pool.get_pool())
        .await?;

        if let Some(id) = existing {
            sqlx::query(
                "UPDATE kg_entities SET description = COALESCE($2, description) WHERE id = $1",
            )
            .bind(&id)
            .bind(&entity.description)
            .execute(self.pool.get_pool())
            .await?;
            return Ok(id);
        }

        sqlx::query(
            r#"INSERT INTO kg_entities (id, entity_type, name, description)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (id) DO UPDATE SET description = COALESCE($4, kg_entities.description)"#,
        )
        .bind(&entity.id)
        .bind(&entity.entity_type)
        .bind(&entity.name)
        .bind(&entity.description)
        .execute(self.pool.get_pool())
        .await?;

        Ok(entity.id.clone())
    }

    pub async fn upsert_relationship(&self, rel: &KgRelationship) -> Result<()> {
        if !RELATIONSHIP_TYPES.contains(&rel.rel_type.as_str()) {
            anyhow::bail!("Unknown relationship type '{}'", rel.rel_type);
        }
        if let Some(strength) = rel.strength {
            if !(0.0..=1.0).contains(&strength) {
                anyhow::bail!("Relationship strength {} outside [0, 1]", strength);
            }
        }

        let endpoints: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM kg_entities WHERE id = $1 OR id = $2",
        )
        .bind(&rel.source_id)
        .bind(&rel.target_id)
        .fetch_one(self.pool.get_pool())
        .await?;

        let required = if rel.source_id == rel.target_id { 1 } else { 2 };
        if endpoints < required {
            anyhow::bail!(
                "Relationship endpoints missing: {} -> {}",
                rel.source_id,
                rel.target_id
            );
        }

        sqlx::query(
            r#"INSERT INTO kg_relationships (source_id, target_id, rel_type, strength)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (source_id, target_id, rel_type)
               DO UPDATE SET strength = COALESCE($4, kg_relationships.strength)"#,
        )
        .bind(&rel.source_id)
        .bind(&rel.target_id)
        .bind(&rel.rel_type)
        .bind(rel.strength)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    pub async fn find_entity_by_name(&self, name: &str, limit: i64) -> Result<Vec<KgEntity>> {
        let pattern = format!("%{}%", name.trim());

        let entities = sqlx::query_as::<_, KgEntity>(
            r#"SELECT id, entity_type, name, description
               FROM kg_entities
               WHERE name ILIKE $1
               ORDER BY LENGTH(name) ASC
               LIMIT $2"#,
        )
        .bind(&pattern)
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(entities)
    }

    /// Breadth-first traversal from `start_id`, depth capped at
    /// `MAX_TRAVERSAL_DEPTH`. Cycles are cut by the visited set. The result
    /// lists nodes and typed edges so the model can read it without further
    /// calls.
    pub async fn traverse(&self, start_id: &str, max_depth: usize) -> Result<Subgraph> {
        let depth = max_depth.clamp(1, MAX_TRAVERSAL_DEPTH);

        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier: Vec<String> = vec![start_id.to_string()];
        visited.insert(start_id.to_string());

        let mut edges: Vec<KgRelationship> = Vec::new();

        for _ in 0..depth {
            if frontier.is_empty() {
                break;
            }

            let layer = sqlx::query_as::<_, KgRelationship>(
                r#"SELECT source_id, target_id, rel_type, strength
                   FROM kg_relationships
                   WHERE source_id = ANY($1) OR target_id = ANY($1)"#,
            )
            .bind(&frontier)
            .fetch_all(self.pool.get_pool())
            .await?;

            let mut next_frontier = Vec::new();
            for edge in layer {
                for node in [&edge.source_id, &edge.target_id] {
                    if visited.insert(node.clone()) {
                        next_frontier.push(node.clone());
                    }
                }
                if !edges.iter().any(|e: &KgRelationship| {
                    e.source_id == edge.source_id
                        && e.target_id == edge.target_id
                        && e.rel_type == edge.rel_type
                }) {
                    edges.push(edge);
                }
            }

            frontier = next_frontier;
        }

        let ids: Vec<String> = visited.into_iter().collect();
        let nodes = sqlx::query_as::<_, KgEntity>(
            "SELECT id, entity_type, name, description FROM kg_entities WHERE id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(self.pool.get_pool())
        .await?;

        debug!(
            "Traversal from {} (depth {}): {} nodes, {} edges",
            start_id,
            depth,
            nodes.len(),
            edges.len()
        );

        Ok(Subgraph { nodes, edges })
    }

    pub async fn entity_count(&self) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM kg_entities")
            .fetch_one(self.pool.get_pool())
            .await?;
        Ok(count)
    }
}

use super::{DbPool, GoldenRoute};
use anyhow::Result;
use pgvector::Vector;
use sqlx::types::Json;
use tracing::debug;

/// Golden route cache: canonical query fingerprint → known-good parent keys.
/// Lookup is by embedding similarity so paraphrases of a recurring question
/// also hit the cached route.
pub struct RouteStore {
    pool: DbPool,
}

impl RouteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Nearest cached route with its cosine similarity to the query.
    pub async fn nearest(&self, embedding: &[f32]) -> Result<Option<(GoldenRoute, f32)>> {
        let vector = Vector::from(embedding.to_vec());

        #[derive(sqlx::FromRow)]
        struct RouteRow {
            id: i64,
            fingerprint: String,
            query_text: String,
            parent_keys: Json<Vec<String>>,
            collection: String,
            hits: i64,
            similarity: f64,
        }

        let row = sqlx::query_as::<_, RouteRow>(
            r#"SELECT id, fingerprint, query_text, parent_keys, collection, hits,
                      1 - (embedding <=> $1) AS similarity
               FROM golden_routes
               ORDER BY embedding <=> $1
               LIMIT 1"#,
        )
        .bind(vector)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(row.map(|r| {
            (
                GoldenRoute {
                    id: r.id,
                    fingerprint: r.fingerprint,
                    query_text: r.query_text,
                    parent_keys: r.parent_keys,
                    collection: r.collection,
                    hits: r.hits,
                },
                crate::utils::similarity::normalize_score(r.similarity as f32),
            )
        }))
    }

    pub async fn upsert(
        &self,
        fingerprint: &str,
        query_text: &str,
        embedding: &[f32],
        parent_keys: &[String],
        collection: &str,
    ) -> Result<()> {
        let vector = Vector::from(embedding.to_vec());

        sqlx::query(
            r#"INSERT INTO golden_routes (fingerprint, query_text, embedding, parent_keys, collection, hits)
               VALUES ($1, $2, $3, $4, $5, 0)
               ON CONFLICT (fingerprint)
               DO UPDATE SET query_text = $2, embedding = $3, parent_keys = $4, collection = $5"#,
        )
        .bind(fingerprint)
        .bind(query_text)
        .bind(vector)
        .bind(Json(parent_keys))
        .bind(collection)
        .execute(self.pool.get_pool())
        .await?;

        debug!("Upserted golden route {}", fingerprint);
        Ok(())
    }

    pub async fn record_hit(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE golden_routes SET hits = hits + 1 WHERE id = $1")
            .bind(id)
            .execute(self.pool.get_pool())
            .await?;

        Ok(())
    }

    /// Drop rarely used routes; called by the scheduled refresh task.
    pub async fn prune_stale(&self, min_hits: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM golden_routes WHERE hits < $1 AND created_at < NOW() - INTERVAL '30 days'",
        )
        .bind(min_hits)
        .execute(self.pool.get_pool())
        .await?;

        Ok(result.rows_affected())
    }
}

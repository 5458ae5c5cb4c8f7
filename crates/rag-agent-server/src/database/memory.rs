use super::{DbPool, MemoryFact, UserProfile};
use anyhow::Result;
use chrono::Utc;
use tracing::debug;

/// Users, memory facts and per-user rolling summaries. Facts are append-only;
/// purge is TTL-based and external.
pub struct MemoryStore {
    pool: DbPool,
}

impl MemoryStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let profile = sqlx::query_as::<_, UserProfile>(
            r#"SELECT user_id, name, role, department, language, notes
               FROM users
               WHERE user_id = $1"#,
        )
        .bind(user_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(profile)
    }

    /// Most recent facts ranked by recency × confidence. Fetches a wider
    /// window ordered by time, then scores in-process: a week-old fact at
    /// confidence 1.0 ranks with a fresh fact at ~0.5.
    pub async fn recent_facts(&self, user_id: &str, k: usize) -> Result<Vec<MemoryFact>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let window = (k * 3).max(20) as i64;
        let mut facts = sqlx::query_as::<_, MemoryFact>(
            r#"SELECT id, user_id, content, source, confidence, created_at
               FROM memory_facts
               WHERE user_id = $1
               ORDER BY created_at DESC
               LIMIT $2"#,
        )
        .bind(user_id)
        .bind(window)
        .fetch_all(self.pool.get_pool())
        .await?;

        let now = Utc::now();
        facts.sort_by(|a, b| {
            let score = |f: &MemoryFact| {
                let age_days = (now - f.created_at).num_seconds().max(0) as f64 / 86_400.0;
                let recency = (-age_days / 7.0).exp();
                f.confidence as f64 * recency
            };
            score(b)
                .partial_cmp(&score(a))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        facts.truncate(k);

        Ok(facts)
    }

    pub async fn append_fact(
        &self,
        user_id: &str,
        content: &str,
        source: &str,
        confidence: f32,
    ) -> Result<()> {
        let confidence = confidence.clamp(0.0, 1.0);

        sqlx::query(
            r#"INSERT INTO memory_facts (user_id, content, source, confidence)
               VALUES ($1, $2, $3, $4)"#,
        )
        .bind(user_id)
        .bind(content)
        .bind(source)
        .bind(confidence)
        .execute(self.pool.get_pool())
        .await?;

        debug!("Appended memory fact for user {}", user_id);
        Ok(())
    }

    pub async fn get_summary(&self, user_id: &str) -> Result<Option<String>> {
        let summary: Option<String> = sqlx::query_scalar(
            "SELECT summary FROM memory_summaries WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(summary)
    }

    pub async fn set_summary(&self, user_id: &str, summary: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO memory_summaries (user_id, summary, updated_at)
               VALUES ($1, $2, NOW())
               ON CONFLICT (user_id) DO UPDATE SET summary = $2, updated_at = NOW()"#,
        )
        .bind(user_id)
        .bind(summary)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }
}

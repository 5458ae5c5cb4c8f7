use super::{ConversationTurn, DbPool};
use anyhow::Result;
use sqlx::types::Json;
use tracing::debug;

/// Durable conversation log. Writes are append-only; turns carry a strictly
/// increasing per-conversation sequence number.
pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_conversation(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO conversations (conversation_id, user_id)
               VALUES ($1, $2)
               ON CONFLICT (conversation_id) DO NOTHING"#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .execute(self.pool.get_pool())
        .await?;

        Ok(())
    }

    pub async fn conversation_exists(&self, conversation_id: &str) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_one(self.pool.get_pool())
                .await?;

        Ok(count > 0)
    }

    /// Append one turn. The sequence number is assigned inside the insert so
    /// two writers cannot produce a gap or a duplicate.
    pub async fn append_turn(
        &self,
        conversation_id: &str,
        role: &str,
        content: &str,
        tool_name: Option<&str>,
        tool_args: Option<&serde_json::Value>,
    ) -> Result<i32> {
        let seq: i32 = sqlx::query_scalar(
            r#"INSERT INTO conversation_turns
               (conversation_id, seq, role, content, tool_name, tool_args)
               SELECT $1, COALESCE(MAX(seq), 0) + 1, $2, $3, $4, $5
               FROM conversation_turns
               WHERE conversation_id = $1
               RETURNING seq"#,
        )
        .bind(conversation_id)
        .bind(role)
        .bind(content)
        .bind(tool_name)
        .bind(tool_args.map(Json))
        .fetch_one(self.pool.get_pool())
        .await?;

        debug!(
            "Appended {} turn #{} to conversation {}",
            role, seq, conversation_id
        );
        Ok(seq)
    }

    /// Last `k` turns in chronological order.
    pub async fn recent(&self, conversation_id: &str, k: usize) -> Result<Vec<ConversationTurn>> {
        let mut turns = sqlx::query_as::<_, ConversationTurn>(
            r#"SELECT id, conversation_id, seq, role, content, tool_name, tool_args, created_at
               FROM conversation_turns
               WHERE conversation_id = $1
               ORDER BY seq DESC
               LIMIT $2"#,
        )
        .bind(conversation_id)
        .bind(k as i64)
        .fetch_all(self.pool.get_pool())
        .await?;

        turns.reverse();
        Ok(turns)
    }
}

use super::{models::parent_key, DbPool, DocumentRecord, ParentChunk};
use crate::models::ingest::{DocumentPayload, ParentPayload};
use anyhow::Result;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

/// Durable store of documents and parent chunks. The relational store is the
/// single source of truth for text; the vector store only keys back into it.
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get_document(&self, document_id: &str) -> Result<Option<DocumentRecord>> {
        let doc = sqlx::query_as::<_, DocumentRecord>(
            r#"SELECT document_id, doc_type, title, issuing_authority, year, language,
                      source_uri, ingestion_run_id, is_canonical, ocr_quality, created_at
               FROM documents
               WHERE document_id = $1 AND is_canonical = TRUE"#,
        )
        .bind(document_id)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(doc)
    }

    /// Insert a new canonical version of a document. Any previous canonical
    /// row is demoted but retained for audit.
    pub async fn upsert_document(
        &self,
        payload: &DocumentPayload,
        ingestion_run_id: Uuid,
    ) -> Result<()> {
        let mut transaction = self.pool.get_pool().begin().await?;

        sqlx::query(
            "UPDATE documents SET is_canonical = FALSE WHERE document_id = $1 AND is_canonical = TRUE",
        )
        .bind(&payload.document_id)
        .execute(&mut *transaction)
        .await?;

        sqlx::query(
            r#"INSERT INTO documents
               (document_id, doc_type, title, issuing_authority, year, language,
                source_uri, ingestion_run_id, is_canonical, ocr_quality)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, TRUE, $9)"#,
        )
        .bind(&payload.document_id)
        .bind(&payload.doc_type)
        .bind(&payload.title)
        .bind(&payload.issuing_authority)
        .bind(payload.year)
        .bind(&payload.language)
        .bind(&payload.source_uri)
        .bind(ingestion_run_id)
        .bind(payload.ocr_quality)
        .execute(&mut *transaction)
        .await?;

        transaction.commit().await?;
        debug!("Upserted canonical document {}", payload.document_id);

        Ok(())
    }

    /// Fetch the canonical parent by its composite key ("doc_id:hierarchy_path").
    pub async fn get_parent(&self, key: &str) -> Result<Option<ParentChunk>> {
        let Some((document_id, hierarchy_path)) = super::models::split_parent_key(key) else {
            return Ok(None);
        };

        let parent = sqlx::query_as::<_, ParentChunk>(
            r#"SELECT id, document_id, hierarchy_path, parent_path, level, full_text,
                      char_count, pasal_count, summary, child_chunk_ids,
                      text_fingerprint, is_canonical, created_at
               FROM parent_documents
               WHERE document_id = $1 AND hierarchy_path = $2 AND is_canonical = TRUE"#,
        )
        .bind(document_id)
        .bind(hierarchy_path)
        .fetch_optional(self.pool.get_pool())
        .await?;

        Ok(parent)
    }

    /// Batch variant of `get_parent` used by the retriever join.
    pub async fn get_parents_by_keys(&self, keys: &[String]) -> Result<Vec<ParentChunk>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut doc_ids = Vec::with_capacity(keys.len());
        let mut paths = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((doc, path)) = super::models::split_parent_key(key) {
                doc_ids.push(doc.to_string());
                paths.push(path.to_string());
            }
        }

        let parents = sqlx::query_as::<_, ParentChunk>(
            r#"SELECT p.id, p.document_id, p.hierarchy_path, p.parent_path, p.level,
                      p.full_text, p.char_count, p.pasal_count, p.summary,
                      p.child_chunk_ids, p.text_fingerprint, p.is_canonical, p.created_at
               FROM parent_documents p
               JOIN UNNEST($1::text[], $2::text[]) AS k(document_id, hierarchy_path)
                 ON p.document_id = k.document_id AND p.hierarchy_path = k.hierarchy_path
               WHERE p.is_canonical = TRUE"#,
        )
        .bind(&doc_ids)
        .bind(&paths)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(parents)
    }

    pub async fn list_parents(&self, document_id: &str) -> Result<Vec<ParentChunk>> {
        let parents = sqlx::query_as::<_, ParentChunk>(
            r#"SELECT id, document_id, hierarchy_path, parent_path, level, full_text,
                      char_count, pasal_count, summary, child_chunk_ids,
                      text_fingerprint, is_canonical, created_at
               FROM parent_documents
               WHERE document_id = $1 AND is_canonical = TRUE
               ORDER BY id"#,
        )
        .bind(document_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(parents)
    }

    /// Parent text plus its ancestors, walking `parent_path` upward at most
    /// `depth` levels. Returned root-first.
    pub async fn get_full_text(&self, key: &str, depth: usize) -> Result<Vec<ParentChunk>> {
        let mut chain = Vec::new();

        let Some(start) = self.get_parent(key).await? else {
            return Ok(chain);
        };

        let mut cursor = start.parent_path.clone();
        let document_id = start.document_id.clone();
        chain.push(start);

        for _ in 0..depth {
            let Some(path) = cursor else { break };
            let Some(ancestor) = self.get_parent(&parent_key(&document_id, &path)).await? else {
                break;
            };
            cursor = ancestor.parent_path.clone();
            chain.push(ancestor);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Fingerprints of the current canonical parent set, used by ingest to
    /// detect an unchanged re-ingest before touching the vector store.
    pub async fn get_parent_fingerprints(
        &self,
        document_id: &str,
    ) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"SELECT hierarchy_path, text_fingerprint
               FROM parent_documents
               WHERE document_id = $1 AND is_canonical = TRUE
               ORDER BY id"#,
        )
        .bind(document_id)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(rows)
    }

    /// Insert a full canonical parent set in one transaction, demoting any
    /// previous canonical rows. `(document_id, hierarchy_path)` is unique
    /// within the canonical set.
    pub async fn insert_parents(
        &self,
        document_id: &str,
        parents: &[ParentPayload],
        fingerprints: &[String],
    ) -> Result<Vec<i64>> {
        let mut transaction = self.pool.get_pool().begin().await?;

        sqlx::query(
            "UPDATE parent_documents SET is_canonical = FALSE WHERE document_id = $1 AND is_canonical = TRUE",
        )
        .bind(document_id)
        .execute(&mut *transaction)
        .await?;

        let mut ids = Vec::with_capacity(parents.len());
        for (parent, fingerprint) in parents.iter().zip(fingerprints) {
            let pasal_count = parent
                .text
                .matches("Pasal ")
                .count()
                .min(i32::MAX as usize) as i32;

            let id: i64 = sqlx::query_scalar(
                r#"INSERT INTO parent_documents
                   (document_id, hierarchy_path, parent_path, level, full_text,
                    char_count, pasal_count, summary, child_chunk_ids,
                    text_fingerprint, is_canonical)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, '[]'::jsonb, $9, TRUE)
                   RETURNING id"#,
            )
            .bind(document_id)
            .bind(&parent.hierarchy_path)
            .bind(&parent.parent_path)
            .bind(parent.level)
            .bind(&parent.text)
            .bind(parent.text.chars().count() as i32)
            .bind(pasal_count)
            .bind(&parent.summary)
            .bind(fingerprint)
            .fetch_one(&mut *transaction)
            .await?;

            ids.push(id);
        }

        transaction.commit().await?;
        debug!(
            "Inserted {} canonical parents for document {}",
            ids.len(),
            document_id
        );

        Ok(ids)
    }

    /// Record the ordered vector point ids belonging to a parent.
    pub async fn set_child_chunk_ids(&self, parent_id: i64, child_ids: &[String]) -> Result<()> {
        sqlx::query("UPDATE parent_documents SET child_chunk_ids = $2 WHERE id = $1")
            .bind(parent_id)
            .bind(Json(child_ids))
            .execute(self.pool.get_pool())
            .await?;

        Ok(())
    }

    pub async fn list_document_ids(&self, limit: i64) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"SELECT document_id FROM documents
               WHERE is_canonical = TRUE
               ORDER BY created_at DESC
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(ids)
    }

    /// Most recently ingested canonical parents; feedstock for the scheduled
    /// graph-build sweep.
    pub async fn recent_parents(&self, limit: i64) -> Result<Vec<ParentChunk>> {
        let parents = sqlx::query_as::<_, ParentChunk>(
            r#"SELECT id, document_id, hierarchy_path, parent_path, level, full_text,
                      char_count, pasal_count, summary, child_chunk_ids,
                      text_fingerprint, is_canonical, created_at
               FROM parent_documents
               WHERE is_canonical = TRUE
               ORDER BY created_at DESC
               LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(self.pool.get_pool())
        .await?;

        Ok(parents)
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(self.pool.get_pool()).await?;
        Ok(())
    }
}

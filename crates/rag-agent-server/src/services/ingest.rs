use crate::database::{models::parent_key, Repository};
use crate::logging::{AuditLogger, AuditRecord, Component, RecordKind};
use crate::models::ingest::{IngestDocumentRequest, IngestResponse};
use crate::services::embedding_service::EmbeddingService;
use crate::utils::error::ApiError;
use crate::vector::{ChildPayload, VectorPoint, VectorStore};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::Arc;
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::{debug, info};
use uuid::Uuid;

/// Indexing side of the hybrid store. Parents are written to the relational
/// store before the corresponding children reach the vector store; the
/// retriever relies on that ordering to never see an orphan child.
pub struct IngestService {
    repository: Arc<Repository>,
    embedding: Arc<EmbeddingService>,
    vector_store: Arc<VectorStore>,
    default_collection: String,
    child_chunk_chars: usize,
    audit: AuditLogger,
}

impl IngestService {
    pub fn new(
        repository: Arc<Repository>,
        embedding: Arc<EmbeddingService>,
        vector_store: Arc<VectorStore>,
        default_collection: String,
        child_chunk_chars: usize,
        audit: AuditLogger,
    ) -> Self {
        Self {
            repository,
            embedding,
            vector_store,
            default_collection,
            child_chunk_chars: child_chunk_chars.max(200),
            audit,
        }
    }

    pub async fn ingest_document(
        &self,
        request_id: &str,
        request: IngestDocumentRequest,
    ) -> Result<IngestResponse, ApiError> {
        Self::validate(&request)?;

        let document_id = request.document.document_id.clone();
        let collection = request
            .collection
            .clone()
            .unwrap_or_else(|| self.default_collection.clone());

        let fingerprints: Vec<String> = request
            .parents
            .iter()
            .map(|p| fingerprint(&p.text))
            .collect();

        // Idempotence: an unchanged re-ingest leaves both stores untouched.
        let existing = self
            .repository
            .get_parent_fingerprints(&document_id)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        let incoming: Vec<(String, String)> = request
            .parents
            .iter()
            .zip(&fingerprints)
            .map(|(p, f)| (p.hierarchy_path.clone(), f.clone()))
            .collect();

        if !existing.is_empty() && existing == incoming {
            info!("Document {} unchanged, skipping re-ingest", document_id);
            return Ok(IngestResponse {
                document_id,
                parents_created: 0,
                chunks_created: 0,
            });
        }

        let ingestion_run_id = Uuid::new_v4();
        self.repository
            .upsert_document(&request.document, ingestion_run_id)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        let parent_ids = self
            .repository
            .insert_parents(&document_id, &request.parents, &fingerprints)
            .await
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;

        // Replace this document's children wholesale: content changed, so
        // stale points must not linger next to the new set.
        let delete_filter = crate::vector::Filter::new().eq("document_id", document_id.as_str());
        self.vector_store
            .delete(&collection, &delete_filter)
            .await
            .map_err(|e| ApiError::RetrievalError(e.to_string()))?;

        let mut chunks_created = 0usize;
        let splitter = TextSplitter::new(ChunkConfig::new(self.child_chunk_chars));

        for ((parent, row_id), parent_fingerprint) in
            request.parents.iter().zip(&parent_ids).zip(&fingerprints)
        {
            let key = parent_key(&document_id, &parent.hierarchy_path);
            let chunk_texts: Vec<String> =
                splitter.chunks(&parent.text).map(str::to_string).collect();
            if chunk_texts.is_empty() {
                continue;
            }

            let embeddings = self
                .embedding
                .embed_batch(chunk_texts.clone(), true)
                .await?;

            let mut points = Vec::with_capacity(chunk_texts.len());
            let mut child_ids = Vec::with_capacity(chunk_texts.len());

            for (index, (text, vector)) in chunk_texts.iter().zip(embeddings).enumerate() {
                let point_id =
                    deterministic_point_id(&document_id, &parent.hierarchy_path, index, parent_fingerprint);
                child_ids.push(point_id.clone());

                points.push(VectorPoint {
                    id: point_id,
                    vector,
                    payload: ChildPayload {
                        document_id: document_id.clone(),
                        parent_chunk_ids: vec![key.clone()],
                        hierarchy_path: parent.hierarchy_path.clone(),
                        text: text.clone(),
                        tier: request.tier.clone(),
                        language: request.document.language.clone(),
                        chunk_index: index as i32,
                        fingerprint: fingerprint(text),
                        drive_link: None,
                    },
                });
            }

            chunks_created += self
                .vector_store
                .upsert(&collection, points)
                .await
                .map_err(|e| ApiError::RetrievalError(e.to_string()))?;

            self.repository
                .set_child_chunk_ids(*row_id, &child_ids)
                .await
                .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        }

        self.audit.log(
            AuditRecord::builder(request_id, Component::Ingest, RecordKind::TaskRun)
                .message(format!(
                    "ingested {} ({} parents, {} chunks)",
                    document_id,
                    parent_ids.len(),
                    chunks_created
                ))
                .build(),
        );
        info!(
            "Ingested document {}: {} parents, {} chunks into '{}'",
            document_id,
            parent_ids.len(),
            chunks_created,
            collection
        );

        Ok(IngestResponse {
            document_id,
            parents_created: parent_ids.len(),
            chunks_created,
        })
    }

    /// The parent set must form a tree: unique paths, every non-root parent
    /// path present in the set, at least one root.
    fn validate(request: &IngestDocumentRequest) -> Result<(), ApiError> {
        if request.document.document_id.trim().is_empty() {
            return Err(ApiError::BadRequest("document_id cannot be empty".to_string()));
        }
        if request.parents.is_empty() {
            return Err(ApiError::BadRequest(
                "document must carry at least one parent chunk".to_string(),
            ));
        }

        let mut paths = HashSet::new();
        for parent in &request.parents {
            if parent.hierarchy_path.trim().is_empty() {
                return Err(ApiError::BadRequest(
                    "hierarchy_path cannot be empty".to_string(),
                ));
            }
            if !paths.insert(parent.hierarchy_path.as_str()) {
                return Err(ApiError::BadRequest(format!(
                    "duplicate hierarchy_path '{}'",
                    parent.hierarchy_path
                )));
            }
        }

        let mut has_root = false;
        for parent in &request.parents {
            match &parent.parent_path {
                None => has_root = true,
                Some(path) => {
                    if !paths.contains(path.as_str()) {
                        return Err(ApiError::BadRequest(format!(
                            "parent_path '{}' does not resolve within the document",
                            path
                        )));
                    }
                }
            }
        }
        if !has_root {
            return Err(ApiError::BadRequest(
                "document tree has no root (a parent with null parent_path)".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic point id: re-ingesting identical content produces identical
/// ids, so upserts are idempotent and never duplicate children.
pub fn deterministic_point_id(
    document_id: &str,
    hierarchy_path: &str,
    chunk_index: usize,
    parent_fingerprint: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(hierarchy_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk_index.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(parent_fingerprint.as_bytes());

    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ingest::{DocumentPayload, ParentPayload};

    fn request(parents: Vec<ParentPayload>) -> IngestDocumentRequest {
        IngestDocumentRequest {
            document: DocumentPayload {
                document_id: "PP_31_2013".into(),
                doc_type: "government_regulation".into(),
                title: "PP 31/2013".into(),
                issuing_authority: None,
                year: Some(2013),
                language: "id".into(),
                source_uri: None,
                ocr_quality: None,
            },
            parents,
            collection: None,
            tier: "public".into(),
        }
    }

    fn parent(path: &str, parent_path: Option<&str>) -> ParentPayload {
        ParentPayload {
            hierarchy_path: path.into(),
            parent_path: parent_path.map(str::to_string),
            level: if parent_path.is_none() { 0 } else { 1 },
            text: format!("Isi {}", path),
            summary: None,
        }
    }

    #[test]
    fn test_validate_accepts_tree() {
        let req = request(vec![
            parent("BAB_I", None),
            parent("BAB_I/Pasal_1", Some("BAB_I")),
        ]);
        assert!(IngestService::validate(&req).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_paths() {
        let req = request(vec![parent("BAB_I", None), parent("BAB_I", None)]);
        assert!(IngestService::validate(&req).is_err());
    }

    #[test]
    fn test_validate_rejects_dangling_parent_path() {
        let req = request(vec![parent("BAB_I/Pasal_1", Some("BAB_I"))]);
        assert!(IngestService::validate(&req).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_parents() {
        let req = request(vec![]);
        assert!(IngestService::validate(&req).is_err());
    }

    #[test]
    fn test_deterministic_point_ids_are_stable() {
        let a = deterministic_point_id("PP_31_2013", "BAB_I", 0, "abc");
        let b = deterministic_point_id("PP_31_2013", "BAB_I", 0, "abc");
        assert_eq!(a, b);

        let c = deterministic_point_id("PP_31_2013", "BAB_I", 1, "abc");
        assert_ne!(a, c);

        let d = deterministic_point_id("PP_31_2013", "BAB_I", 0, "other");
        assert_ne!(a, d);
    }

    #[test]
    fn test_fingerprint_is_content_addressed() {
        assert_eq!(fingerprint("pasal 1"), fingerprint("pasal 1"));
        assert_ne!(fingerprint("pasal 1"), fingerprint("pasal 2"));
    }
}

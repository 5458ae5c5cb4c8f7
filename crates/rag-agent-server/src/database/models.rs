use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub doc_type: String,
    pub title: String,
    pub issuing_authority: Option<String>,
    pub year: Option<i32>,
    pub language: String,
    pub source_uri: Option<String>,
    pub ingestion_run_id: Option<Uuid>,
    pub is_canonical: bool,
    pub ocr_quality: Option<f32>,
    pub created_at: DateTime<Utc>,
}

/// A logical unit of a document (BAB, Pasal, section). Parents form a tree
/// per document: root has a null parent_path, children reference their
/// parent's hierarchy_path.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ParentChunk {
    pub id: i64,
    pub document_id: String,
    pub hierarchy_path: String,
    pub parent_path: Option<String>,
    pub level: i32,
    pub full_text: String,
    pub char_count: i32,
    pub pasal_count: i32,
    pub summary: Option<String>,
    /// Vector point ids of this parent's children, in document order.
    pub child_chunk_ids: Json<Vec<String>>,
    pub text_fingerprint: String,
    pub is_canonical: bool,
    pub created_at: DateTime<Utc>,
}

impl ParentChunk {
    /// Stable composite key used in vector payloads and citations.
    pub fn key(&self) -> String {
        parent_key(&self.document_id, &self.hierarchy_path)
    }
}

pub fn parent_key(document_id: &str, hierarchy_path: &str) -> String {
    format!("{}:{}", document_id, hierarchy_path)
}

pub fn split_parent_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(':')
}

// ===== KNOWLEDGE GRAPH =====

pub const ENTITY_TYPES: &[&str] = &[
    "REGULATION",
    "VISA",
    "REQUIREMENT",
    "OBLIGATION",
    "PERMIT",
    "AGENCY",
    "COST",
    "DURATION",
];

pub const RELATIONSHIP_TYPES: &[&str] = &[
    "REQUIRES",
    "AMENDS",
    "REVOKES",
    "DEFINES",
    "COSTS",
    "VALID_FOR",
    "ISSUED_BY",
];

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KgEntity {
    /// Unique lowercase snake_case id, e.g. "investor_kitas_e28a".
    pub id: String,
    pub entity_type: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KgRelationship {
    pub source_id: String,
    pub target_id: String,
    pub rel_type: String,
    pub strength: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Subgraph {
    pub nodes: Vec<KgEntity>,
    pub edges: Vec<KgRelationship>,
}

// ===== USERS & MEMORY =====

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserProfile {
    pub user_id: String,
    pub name: String,
    pub role: String,
    pub department: Option<String>,
    pub language: String,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MemoryFact {
    pub id: i64,
    pub user_id: String,
    pub content: String,
    pub source: String,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

// ===== CONVERSATIONS =====

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ConversationTurn {
    pub id: i64,
    pub conversation_id: String,
    pub seq: i32,
    pub role: String,
    pub content: String,
    pub tool_name: Option<String>,
    pub tool_args: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

// ===== GOLDEN ROUTES =====

#[derive(Debug, Clone, FromRow)]
pub struct GoldenRoute {
    pub id: i64,
    /// Fingerprint of the canonicalized query text.
    pub fingerprint: String,
    pub query_text: String,
    /// Ordered parent chunk keys resolved for this query.
    pub parent_keys: Json<Vec<String>>,
    pub collection: String,
    pub hits: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_key_round_trip() {
        let key = parent_key("PP_31_2013", "BAB_II/Pasal_5");
        assert_eq!(key, "PP_31_2013:BAB_II/Pasal_5");

        let (doc, path) = split_parent_key(&key).unwrap();
        assert_eq!(doc, "PP_31_2013");
        assert_eq!(path, "BAB_II/Pasal_5");
    }

    #[test]
    fn test_split_rejects_malformed_key() {
        assert!(split_parent_key("no_separator").is_none());
    }
}

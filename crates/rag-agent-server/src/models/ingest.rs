use serde::{Deserialize, Serialize};

/// Pre-parsed document payload. File parsing happens upstream; this service
/// owns parent persistence, child slicing, embedding and vector upserts.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestDocumentRequest {
    pub document: DocumentPayload,
    pub parents: Vec<ParentPayload>,
    /// Target vector collection; defaults to the configured default.
    #[serde(default)]
    pub collection: Option<String>,
    #[serde(default = "default_tier")]
    pub tier: String,
}

fn default_tier() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentPayload {
    /// Stable id, e.g. "PP_31_2013".
    pub document_id: String,
    pub doc_type: String,
    pub title: String,
    #[serde(default)]
    pub issuing_authority: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub source_uri: Option<String>,
    #[serde(default)]
    pub ocr_quality: Option<f32>,
}

fn default_language() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParentPayload {
    /// Position in the document tree, e.g. "BAB_II/Pasal_5".
    pub hierarchy_path: String,
    /// Hierarchy path of the parent node; None for the root.
    #[serde(default)]
    pub parent_path: Option<String>,
    pub level: i32,
    pub text: String,
    #[serde(default)]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResponse {
    pub document_id: String,
    pub parents_created: usize,
    pub chunks_created: usize,
}

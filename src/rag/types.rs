use serde::{Deserialize, Serialize};

/// A chunk match surfaced alongside an assistant response.
///
/// `content` may be absent at creation time; it is lazily resolved from the
/// chunk store at finalization so the streaming hot path stays free of
/// extra I/O.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: Option<i64>,
    pub document_name: String,
    pub similarity: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

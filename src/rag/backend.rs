//! Abstract vector-backend contract and the registry of configured backends.
//!
//! Every vendor is driven through the same narrow `search`/`upsert` surface;
//! connection parameters differ per kind but the retriever treats registered
//! backends uniformly.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::errors::CoreError;
use crate::rag::types::Reference;
use crate::store::chunks::ChunkStore;

use super::backends::chroma::ChromaBackend;
use super::backends::local::LocalVectorStore;
use super::backends::milvus::MilvusBackend;
use super::backends::pgvector::PgVectorBackend;
use super::backends::qdrant::QdrantBackend;
use super::backends::weaviate::WeaviateBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Qdrant,
    Weaviate,
    Chroma,
    Pgvector,
    Milvus,
    Local,
}

/// Connection configuration for one vector backend, owned by the
/// configuration registry and read-only during a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDbConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: BackendKind,
    #[serde(default)]
    pub name: String,
    /// HTTP base URL for qdrant/weaviate/chroma/milvus.
    #[serde(default)]
    pub url: String,
    /// Collection (or class/index) name for HTTP backends.
    #[serde(default)]
    pub collection: String,
    /// SQL connection string for pgvector.
    #[serde(default)]
    pub connection_string: String,
    /// Table name for pgvector.
    #[serde(default)]
    pub table: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Document tags this backend serves. Empty means it matches any
    /// session.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl VectorDbConfig {
    pub fn matches_tags(&self, tags: &[String]) -> bool {
        self.tags.is_empty() || self.tags.iter().any(|t| tags.contains(t))
    }
}

/// One raw match from a backend: the stored id, a similarity-style score
/// (higher is better), and whatever payload the backend kept alongside the
/// vector.
#[derive(Debug, Clone)]
pub struct BackendHit {
    pub id: String,
    pub score: f32,
    pub payload: Value,
}

#[async_trait]
pub trait VectorBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Nearest-neighbour search, best matches first.
    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<BackendHit>, CoreError>;

    /// Insert or replace one vector with its payload.
    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: Value,
    ) -> Result<(), CoreError>;
}

/// Convert a backend hit into a reference using the shared payload
/// conventions (`documentId`, `documentName`, `chunkId`, `chunkIndex`,
/// `content`). Missing fields degrade to defaults rather than failing.
pub fn reference_from_hit(hit: BackendHit) -> Reference {
    let payload = hit.payload;
    let text = |key: &str| {
        payload
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    Reference {
        document_id: text("documentId").unwrap_or_default(),
        chunk_id: text("chunkId").unwrap_or(hit.id),
        chunk_index: payload.get("chunkIndex").and_then(|v| v.as_i64()),
        document_name: text("documentName").unwrap_or_else(|| "Unknown Document".to_string()),
        similarity: hit.score.clamp(0.0, 1.0),
        content: text("content"),
    }
}

#[derive(Clone)]
pub struct RegisteredBackend {
    pub config: VectorDbConfig,
    pub backend: Arc<dyn VectorBackend>,
}

/// Registry of configured backends. Read-mostly; adding or removing a
/// backend does not block in-flight turns — a turn that already snapshotted
/// the registry may still complete against a just-disabled backend.
pub struct BackendRegistry {
    entries: RwLock<Vec<RegisteredBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Build the registry from configuration. A backend that fails to
    /// construct is skipped with a warning, not a startup failure.
    pub fn from_config(configs: &[VectorDbConfig], chunks: Arc<ChunkStore>) -> Self {
        let registry = Self::new();
        for config in configs {
            match connect(config, &chunks) {
                Ok(backend) => registry.register(config.clone(), backend),
                Err(e) => {
                    tracing::warn!("skipping backend {}: {}", config.id, e);
                }
            }
        }
        registry
    }

    pub fn register(&self, config: VectorDbConfig, backend: Arc<dyn VectorBackend>) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.retain(|entry| entry.config.id != config.id);
        entries.push(RegisteredBackend { config, backend });
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.config.id != id);
        entries.len() != before
    }

    /// Snapshot of enabled backends whose tag sets intersect `tags`,
    /// in registration order.
    pub fn enabled_for_tags(&self, tags: &[String]) -> Vec<RegisteredBackend> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|entry| entry.config.enabled && entry.config.matches_tags(tags))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn connect(
    config: &VectorDbConfig,
    chunks: &Arc<ChunkStore>,
) -> Result<Arc<dyn VectorBackend>, CoreError> {
    let backend: Arc<dyn VectorBackend> = match config.kind {
        BackendKind::Local => Arc::new(LocalVectorStore::new(chunks.clone())),
        BackendKind::Qdrant => Arc::new(QdrantBackend::new(&config.url)),
        BackendKind::Chroma => Arc::new(ChromaBackend::new(&config.url)),
        BackendKind::Weaviate => Arc::new(WeaviateBackend::new(&config.url)),
        BackendKind::Milvus => Arc::new(MilvusBackend::new(&config.url)),
        BackendKind::Pgvector => Arc::new(PgVectorBackend::connect_lazy(
            &config.connection_string,
            &config.table,
        )?),
    };
    Ok(backend)
}

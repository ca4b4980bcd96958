//! In-process vector backend over the embedded chunk store.
//!
//! Brute-force cosine similarity against every stored chunk. No external
//! service, which makes it the default backend for a fully offline install.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::errors::CoreError;
use crate::rag::backend::{BackendHit, BackendKind, VectorBackend};
use crate::store::chunks::{ChunkStore, DocumentChunk};

pub struct LocalVectorStore {
    chunks: Arc<ChunkStore>,
}

impl LocalVectorStore {
    pub fn new(chunks: Arc<ChunkStore>) -> Self {
        Self { chunks }
    }
}

#[async_trait]
impl VectorBackend for LocalVectorStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    // The local store has a single implicit collection; the parameter is
    // accepted for contract uniformity and ignored.
    async fn search(
        &self,
        _collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<BackendHit>, CoreError> {
        let scored = self.chunks.search_similar(query_vector, top_k).await?;

        Ok(scored
            .into_iter()
            .map(|s| BackendHit {
                id: s.chunk.id.clone(),
                score: s.score,
                payload: json!({
                    "documentId": s.chunk.document_id,
                    "documentName": s.chunk.document_name,
                    "chunkId": s.chunk.id,
                    "chunkIndex": s.chunk.chunk_index,
                    "content": s.chunk.content,
                }),
            })
            .collect())
    }

    async fn upsert(
        &self,
        _collection: &str,
        id: &str,
        vector: &[f32],
        payload: Value,
    ) -> Result<(), CoreError> {
        let text = |key: &str| {
            payload
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };

        let chunk = DocumentChunk {
            id: id.to_string(),
            document_id: text("documentId"),
            chunk_index: payload
                .get("chunkIndex")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            content: text("content"),
            embedding: vector.to_vec(),
            document_name: text("documentName"),
        };

        self.chunks.insert_chunk(&chunk).await
    }
}

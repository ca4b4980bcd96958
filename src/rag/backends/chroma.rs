//! Chroma adapter (REST query API).
//!
//! Chroma reports distances, not similarities; scores are mapped to
//! `1 - distance` and clamped.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::errors::CoreError;
use crate::rag::backend::{BackendHit, BackendKind, VectorBackend};

pub struct ChromaBackend {
    base_url: String,
    client: Client,
}

impl ChromaBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn parse_hits(payload: &Value) -> Vec<BackendHit> {
        // Batched response: one inner array per query embedding.
        let ids = payload["ids"][0].as_array();
        let distances = payload["distances"][0].as_array();
        let metadatas = payload["metadatas"][0].as_array();
        let documents = payload["documents"][0].as_array();

        let Some(ids) = ids else {
            return Vec::new();
        };

        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let distance = distances
                    .and_then(|d| d.get(i))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(1.0);
                let mut hit_payload = metadatas
                    .and_then(|m| m.get(i))
                    .cloned()
                    .unwrap_or_else(|| json!({}));
                if !hit_payload.is_object() {
                    hit_payload = json!({});
                }
                if let Some(document) = documents.and_then(|d| d.get(i)).and_then(|v| v.as_str()) {
                    if let Some(obj) = hit_payload.as_object_mut() {
                        obj.insert("content".to_string(), json!(document));
                    }
                }

                BackendHit {
                    id: id.as_str().unwrap_or_default().to_string(),
                    score: (1.0 - distance).clamp(0.0, 1.0) as f32,
                    payload: hit_payload,
                }
            })
            .collect()
    }
}

#[async_trait]
impl VectorBackend for ChromaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Chroma
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<BackendHit>, CoreError> {
        let url = format!(
            "{}/api/v1/collections/{}/query",
            self.base_url, collection
        );
        let body = json!({
            "query_embeddings": [query_vector],
            "n_results": top_k,
            "include": ["metadatas", "documents", "distances"],
        });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(CoreError::retrieval)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::Retrieval(format!("chroma query: {}", text)));
        }

        let payload: Value = res.json().await.map_err(CoreError::retrieval)?;
        Ok(Self::parse_hits(&payload))
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: Value,
    ) -> Result<(), CoreError> {
        let url = format!("{}/api/v1/collections/{}/upsert", self.base_url, collection);
        let content = payload
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let body = json!({
            "ids": [id],
            "embeddings": [vector],
            "metadatas": [payload],
            "documents": [content],
        });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(CoreError::retrieval)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::Retrieval(format!("chroma upsert: {}", text)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_hits_maps_distance_to_similarity() {
        let payload = json!({
            "ids": [["c1", "c2"]],
            "distances": [[0.1, 0.6]],
            "metadatas": [[{ "documentId": "d1" }, null]],
            "documents": [["first text", "second text"]],
        });

        let hits = ChromaBackend::parse_hits(&payload);
        assert_eq!(hits.len(), 2);
        assert!((hits[0].score - 0.9).abs() < 1e-6);
        assert_eq!(hits[0].payload["documentId"], "d1");
        assert_eq!(hits[0].payload["content"], "first text");
        assert!((hits[1].score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn parse_hits_on_empty_response() {
        assert!(ChromaBackend::parse_hits(&json!({})).is_empty());
    }
}

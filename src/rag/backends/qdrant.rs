//! Qdrant adapter (REST points API).

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::errors::CoreError;
use crate::rag::backend::{BackendHit, BackendKind, VectorBackend};

pub struct QdrantBackend {
    base_url: String,
    client: Client,
}

impl QdrantBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn parse_hits(payload: &Value) -> Vec<BackendHit> {
        payload["result"]
            .as_array()
            .map(|points| {
                points
                    .iter()
                    .map(|point| BackendHit {
                        // Qdrant point ids may be integers or UUID strings.
                        id: match &point["id"] {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        },
                        score: point["score"].as_f64().unwrap_or(0.0) as f32,
                        payload: point.get("payload").cloned().unwrap_or(Value::Null),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorBackend for QdrantBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Qdrant
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<BackendHit>, CoreError> {
        let url = format!("{}/collections/{}/points/search", self.base_url, collection);
        let body = json!({
            "vector": query_vector,
            "limit": top_k,
            "with_payload": true,
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
            return Err(CoreError::Retrieval(format!("qdrant search: {}", text)));
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
        let url = format!("{}/collections/{}/points", self.base_url, collection);
        let body = json!({
            "points": [{
                "id": id,
                "vector": vector,
                "payload": payload,
            }]
        });

        let res = self
            .client
            .put(&url)
            .json(&body)
            .send()
            .await
            .map_err(CoreError::retrieval)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::Retrieval(format!("qdrant upsert: {}", text)));
        }

        Ok(())
    }
}

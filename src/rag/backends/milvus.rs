//! Milvus adapter (REST v2 vector API).
//!
//! Assumes a cosine metric, where Milvus reports higher distances for
//! closer vectors; the raw distance is used as the score.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::errors::CoreError;
use crate::rag::backend::{BackendHit, BackendKind, VectorBackend};

pub struct MilvusBackend {
    base_url: String,
    client: Client,
}

impl MilvusBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn parse_hits(payload: &Value) -> Vec<BackendHit> {
        payload["data"]
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        let mut hit_payload = row.clone();
                        if let Some(obj) = hit_payload.as_object_mut() {
                            obj.remove("distance");
                        }
                        BackendHit {
                            id: match &row["id"] {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            },
                            score: row["distance"].as_f64().unwrap_or(0.0) as f32,
                            payload: hit_payload,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorBackend for MilvusBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Milvus
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<BackendHit>, CoreError> {
        let url = format!("{}/v2/vectordb/entities/search", self.base_url);
        let body = json!({
            "collectionName": collection,
            "data": [query_vector],
            "limit": top_k,
            "outputFields": ["*"],
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
            return Err(CoreError::Retrieval(format!("milvus search: {}", text)));
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
        let url = format!("{}/v2/vectordb/entities/upsert", self.base_url);
        let mut row = payload;
        if let Some(obj) = row.as_object_mut() {
            obj.insert("id".to_string(), json!(id));
            obj.insert("vector".to_string(), json!(vector));
        }
        let body = json!({
            "collectionName": collection,
            "data": [row],
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
            return Err(CoreError::Retrieval(format!("milvus upsert: {}", text)));
        }

        Ok(())
    }
}

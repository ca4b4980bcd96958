//! Weaviate adapter (GraphQL `Get` with `nearVector`).
//!
//! The collection name doubles as the Weaviate class name. Certainty is
//! already in [0, 1] and is used as the similarity score.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use crate::core::errors::CoreError;
use crate::rag::backend::{BackendHit, BackendKind, VectorBackend};

pub struct WeaviateBackend {
    base_url: String,
    client: Client,
}

impl WeaviateBackend {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
        }
    }

    fn search_query(class: &str, query_vector: &[f32], top_k: usize) -> String {
        let vector = query_vector
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{{ Get {{ {class}(limit: {top_k}, nearVector: {{ vector: [{vector}] }}) \
             {{ documentId documentName chunkId chunkIndex content \
             _additional {{ id certainty }} }} }} }}"
        )
    }

    fn parse_hits(payload: &Value, class: &str) -> Vec<BackendHit> {
        payload["data"]["Get"][class]
            .as_array()
            .map(|objects| {
                objects
                    .iter()
                    .map(|object| {
                        let additional = &object["_additional"];
                        let mut hit_payload = object.clone();
                        if let Some(obj) = hit_payload.as_object_mut() {
                            obj.remove("_additional");
                        }
                        BackendHit {
                            id: additional["id"].as_str().unwrap_or_default().to_string(),
                            score: additional["certainty"].as_f64().unwrap_or(0.0) as f32,
                            payload: hit_payload,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorBackend for WeaviateBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Weaviate
    }

    async fn search(
        &self,
        collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<BackendHit>, CoreError> {
        let url = format!("{}/v1/graphql", self.base_url);
        let body = json!({ "query": Self::search_query(collection, query_vector, top_k) });

        let res = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(CoreError::retrieval)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::Retrieval(format!("weaviate search: {}", text)));
        }

        let payload: Value = res.json().await.map_err(CoreError::retrieval)?;
        Ok(Self::parse_hits(&payload, collection))
    }

    async fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        payload: Value,
    ) -> Result<(), CoreError> {
        let url = format!("{}/v1/objects", self.base_url);
        let body = json!({
            "class": collection,
            "id": id,
            "vector": vector,
            "properties": payload,
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
            return Err(CoreError::Retrieval(format!("weaviate upsert: {}", text)));
        }

        Ok(())
    }
}

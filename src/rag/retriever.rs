//! Cross-backend retrieval.
//!
//! Embeds the query once, fans out to every enabled backend matching the
//! session's document tags, merges by similarity, and truncates to top-k.
//! Backend failures degrade the result set instead of failing the turn, and
//! the whole step runs under one aggregate deadline.

use std::sync::Arc;
use std::time::Duration;

use crate::core::config::CoreConfig;
use crate::core::errors::CoreError;
use crate::llm::provider::ChatProvider;

use super::backend::{reference_from_hit, BackendRegistry, RegisteredBackend};
use super::types::Reference;

pub struct Retriever {
    provider: Arc<dyn ChatProvider>,
    registry: Arc<BackendRegistry>,
    embeddings_model: String,
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        registry: Arc<BackendRegistry>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            embeddings_model: config.api.embeddings_model.clone(),
            timeout: Duration::from_secs(config.retrieval.timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Ranked references for `query` across all enabled backends matching
    /// `tags`, best first, at most `top_k`. Never fails: zero backends, an
    /// unreachable backend, or a failed embedding all degrade to fewer (or
    /// zero) results.
    pub async fn retrieve(&self, query: &str, tags: &[String], top_k: usize) -> Vec<Reference> {
        let backends = self.registry.enabled_for_tags(tags);
        self.retrieve_with(query, top_k, backends).await
    }

    pub async fn retrieve_with(
        &self,
        query: &str,
        top_k: usize,
        backends: Vec<RegisteredBackend>,
    ) -> Vec<Reference> {
        if backends.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let query_embedding = match self.embed_query(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::warn!("query embedding failed, skipping retrieval: {}", e);
                return Vec::new();
            }
        };

        // All backends run concurrently under one shared ceiling; a backend
        // that never answers degrades to zero results from that backend.
        let searches = backends.iter().map(|entry| {
            let embedding = &query_embedding;
            async move {
                let search = entry
                    .backend
                    .search(&entry.config.collection, embedding, top_k);
                match tokio::time::timeout(self.timeout, search).await {
                    Ok(Ok(hits)) => hits.into_iter().map(reference_from_hit).collect(),
                    Ok(Err(e)) => {
                        tracing::warn!("backend {} failed: {}", entry.config.id, e);
                        Vec::new()
                    }
                    Err(_) => {
                        tracing::warn!("backend {} timed out", entry.config.id);
                        Vec::new()
                    }
                }
            }
        });

        // join_all keeps input order, so ties resolve by backend order below.
        let mut merged: Vec<Reference> = futures_util::future::join_all(searches)
            .await
            .into_iter()
            .flatten()
            .collect();

        // Stable sort: equal similarities keep backend iteration order.
        merged.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        merged.truncate(top_k);
        merged
    }

    async fn embed_query(&self, query: &str) -> Result<Vec<f32>, CoreError> {
        // Task prefix for nomic-style embedding models.
        let input = format!("search_query: {}", query);
        let mut vectors = self
            .provider
            .embed(&[input], &self.embeddings_model)
            .await?;

        if vectors.is_empty() {
            return Err(CoreError::Retrieval(
                "embeddings response was empty".to_string(),
            ));
        }
        Ok(vectors.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::core::errors::CoreError;
    use crate::llm::cancel::CancelSignal;
    use crate::llm::types::ChatRequest;
    use crate::rag::backend::{BackendHit, BackendKind, VectorBackend, VectorDbConfig};

    struct EmbedOnlyProvider;

    #[async_trait]
    impl ChatProvider for EmbedOnlyProvider {
        fn name(&self) -> &str {
            "embed-only"
        }

        async fn health_check(&self) -> Result<bool, CoreError> {
            Ok(true)
        }

        async fn chat(&self, _request: ChatRequest, _model_id: &str) -> Result<String, CoreError> {
            Ok(String::new())
        }

        async fn stream_chat(
            &self,
            _request: ChatRequest,
            _model_id: &str,
            _cancel: CancelSignal,
        ) -> Result<mpsc::Receiver<Result<String, CoreError>>, CoreError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok(rx)
        }

        async fn embed(
            &self,
            inputs: &[String],
            _model_id: &str,
        ) -> Result<Vec<Vec<f32>>, CoreError> {
            assert!(inputs[0].starts_with("search_query: "));
            Ok(vec![vec![1.0, 0.0, 0.0]])
        }
    }

    struct StaticBackend {
        hits: Vec<BackendHit>,
        delay: Duration,
    }

    impl StaticBackend {
        fn new(hits: Vec<(&str, f32)>) -> Self {
            Self {
                hits: hits
                    .into_iter()
                    .map(|(id, score)| BackendHit {
                        id: id.to_string(),
                        score,
                        payload: json!({ "documentId": "d1", "documentName": "manual.pdf" }),
                    })
                    .collect(),
                delay: Duration::ZERO,
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl VectorBackend for StaticBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn search(
            &self,
            _collection: &str,
            _query_vector: &[f32],
            _top_k: usize,
        ) -> Result<Vec<BackendHit>, CoreError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.hits.clone())
        }

        async fn upsert(
            &self,
            _collection: &str,
            _id: &str,
            _vector: &[f32],
            _payload: serde_json::Value,
        ) -> Result<(), CoreError> {
            Ok(())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl VectorBackend for FailingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Qdrant
        }

        async fn search(
            &self,
            _collection: &str,
            _query_vector: &[f32],
            _top_k: usize,
        ) -> Result<Vec<BackendHit>, CoreError> {
            Err(CoreError::Retrieval("connection refused".to_string()))
        }

        async fn upsert(
            &self,
            _collection: &str,
            _id: &str,
            _vector: &[f32],
            _payload: serde_json::Value,
        ) -> Result<(), CoreError> {
            Err(CoreError::Retrieval("connection refused".to_string()))
        }
    }

    fn backend_config(id: &str) -> VectorDbConfig {
        VectorDbConfig {
            id: id.to_string(),
            kind: BackendKind::Local,
            name: id.to_string(),
            url: String::new(),
            collection: "documents".to_string(),
            connection_string: String::new(),
            table: String::new(),
            enabled: true,
            tags: vec![],
        }
    }

    fn retriever_with(backends: Vec<(&str, Arc<dyn VectorBackend>)>) -> Retriever {
        let registry = Arc::new(BackendRegistry::new());
        for (id, backend) in backends {
            registry.register(backend_config(id), backend);
        }
        Retriever::new(
            Arc::new(EmbedOnlyProvider),
            registry,
            &CoreConfig::default(),
        )
    }

    #[tokio::test]
    async fn no_backends_returns_empty_quickly() {
        let retriever = retriever_with(vec![]);
        let start = std::time::Instant::now();
        let references = retriever.retrieve("anything", &[], 5).await;
        assert!(references.is_empty());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn ranks_across_backends_and_truncates() {
        let retriever = retriever_with(vec![
            (
                "a",
                Arc::new(StaticBackend::new(vec![("c1", 0.92), ("c3", 0.40)]))
                    as Arc<dyn VectorBackend>,
            ),
            (
                "b",
                Arc::new(StaticBackend::new(vec![("c2", 0.81)])) as Arc<dyn VectorBackend>,
            ),
        ]);

        let references = retriever.retrieve("query", &[], 2).await;
        assert_eq!(references.len(), 2);
        assert_eq!(references[0].chunk_id, "c1");
        assert_eq!(references[1].chunk_id, "c2");
        assert!(references[0].similarity >= references[1].similarity);
    }

    #[tokio::test]
    async fn equal_scores_keep_backend_order() {
        let retriever = retriever_with(vec![
            (
                "first",
                Arc::new(StaticBackend::new(vec![("from-first", 0.5)]))
                    as Arc<dyn VectorBackend>,
            ),
            (
                "second",
                Arc::new(StaticBackend::new(vec![("from-second", 0.5)]))
                    as Arc<dyn VectorBackend>,
            ),
        ]);

        let references = retriever.retrieve("query", &[], 5).await;
        assert_eq!(references[0].chunk_id, "from-first");
        assert_eq!(references[1].chunk_id, "from-second");
    }

    #[tokio::test]
    async fn failing_backend_degrades_not_fails() {
        let retriever = retriever_with(vec![
            ("bad", Arc::new(FailingBackend) as Arc<dyn VectorBackend>),
            (
                "good",
                Arc::new(StaticBackend::new(vec![("c1", 0.7)])) as Arc<dyn VectorBackend>,
            ),
        ]);

        let references = retriever.retrieve("query", &[], 5).await;
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].chunk_id, "c1");
    }

    #[tokio::test]
    async fn slow_backend_is_bounded_by_deadline() {
        let retriever = retriever_with(vec![
            (
                "slow",
                Arc::new(StaticBackend::new(vec![("late", 0.9)]).slow(Duration::from_secs(5)))
                    as Arc<dyn VectorBackend>,
            ),
            (
                "fast",
                Arc::new(StaticBackend::new(vec![("quick", 0.6)])) as Arc<dyn VectorBackend>,
            ),
        ])
        .with_timeout(Duration::from_millis(50));

        let start = std::time::Instant::now();
        let references = retriever.retrieve("query", &[], 5).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        // The slow backend is dropped; whatever arrived is returned.
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].chunk_id, "quick");
    }
}

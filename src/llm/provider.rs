use async_trait::async_trait;
use tokio::sync::mpsc;

use super::cancel::CancelSignal;
use super::types::ChatRequest;
use crate::core::errors::CoreError;

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// return the provider name for logs (e.g. "openai")
    fn name(&self) -> &str;

    /// check if the endpoint is reachable
    async fn health_check(&self) -> Result<bool, CoreError>;

    /// chat completion (non-streaming)
    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, CoreError>;

    /// chat completion (streaming); the receiver yields token deltas.
    /// Implementations must observe `cancel` inside the read loop and close
    /// the underlying network stream promptly when it fires.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        model_id: &str,
        cancel: CancelSignal,
    ) -> Result<mpsc::Receiver<Result<String, CoreError>>, CoreError>;

    /// generate embeddings
    async fn embed(&self, inputs: &[String], model_id: &str) -> Result<Vec<Vec<f32>>, CoreError>;
}

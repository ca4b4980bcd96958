//! OpenAI-compatible chat/completions + embeddings client.
//!
//! Works against any endpoint speaking the OpenAI wire format (LM Studio,
//! Ollama, llama.cpp server, hosted gateways). Streaming responses are
//! consumed as server-sent `data:` lines terminated by `[DONE]`.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::cancel::CancelSignal;
use super::provider::ChatProvider;
use super::types::ChatRequest;
use crate::core::config::ApiConfig;
use crate::core::errors::CoreError;

#[derive(Clone)]
pub struct OpenAiProvider {
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client: Client::new(),
        }
    }

    fn post(&self, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.post(url);
        if self.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.api_key)
        }
    }

    fn chat_body(request: &ChatRequest, model_id: &str, stream: bool) -> Value {
        let mut body = json!({
            "model": model_id,
            "messages": request.messages,
            "stream": stream,
        });

        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = request.temperature {
                obj.insert("temperature".to_string(), json!(t));
            }
            if let Some(t) = request.top_p {
                obj.insert("top_p".to_string(), json!(t));
            }
            if let Some(t) = request.max_tokens {
                obj.insert("max_tokens".to_string(), json!(t));
            }
            if let Some(s) = &request.stop {
                obj.insert("stop".to_string(), json!(s));
            }
        }

        body
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let url = format!("{}/models", self.base_url);
        let res = self.client.get(&url).send().await;
        match res {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, CoreError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::chat_body(&request, model_id, false);

        let res = self
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(CoreError::transport)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::CompletionTransport(format!(
                "chat error: {}",
                text
            )));
        }

        let payload: Value = res.json().await.map_err(CoreError::transport)?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string();

        Ok(content)
    }

    async fn stream_chat(
        &self,
        request: ChatRequest,
        model_id: &str,
        cancel: CancelSignal,
    ) -> Result<mpsc::Receiver<Result<String, CoreError>>, CoreError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = Self::chat_body(&request, model_id, true);

        let res = self
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(CoreError::transport)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::CompletionTransport(format!(
                "stream error: {}",
                text
            )));
        }

        let (tx, rx) = mpsc::channel(32);
        let mut stream = res.bytes_stream();
        let mut cancel = cancel;

        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    // Dropping the stream here closes the connection.
                    _ = cancel.cancelled() => return,
                    item = stream.next() => item,
                };

                match item {
                    None => return,
                    Some(Ok(bytes)) => {
                        let chunk_str = String::from_utf8_lossy(&bytes);
                        for line in chunk_str.lines() {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            if line == "data: [DONE]" {
                                return;
                            }

                            if let Some(data) = line.strip_prefix("data: ") {
                                if let Ok(json) = serde_json::from_str::<Value>(data) {
                                    if let Some(content) =
                                        json["choices"][0]["delta"]["content"].as_str()
                                    {
                                        if !content.is_empty()
                                            && tx.send(Ok(content.to_string())).await.is_err()
                                        {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(CoreError::transport(e))).await;
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn embed(&self, inputs: &[String], model_id: &str) -> Result<Vec<Vec<f32>>, CoreError> {
        let url = format!("{}/embeddings", self.base_url);

        let body = json!({
            "model": model_id,
            "input": inputs,
        });

        let res = self
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(CoreError::retrieval)?;

        if !res.status().is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(CoreError::Retrieval(format!("embeddings error: {}", text)));
        }

        let payload: Value = res.json().await.map_err(CoreError::retrieval)?;

        let mut embeddings = Vec::new();
        if let Some(data) = payload["data"].as_array() {
            for item in data {
                if let Some(vals) = item["embedding"].as_array() {
                    let vec: Vec<f32> = vals
                        .iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect();
                    embeddings.push(vec);
                }
            }
        }

        Ok(embeddings)
    }
}

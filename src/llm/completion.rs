//! Plain and RAG-augmented streaming completions.
//!
//! Both operations forward token deltas to the caller as they arrive and
//! settle into exactly one `CompletionOutcome` — on natural completion, on
//! cancellation, or on transport failure. Cancellation is a terminal state
//! of the outcome, never an error, so finalization logic upstream is not
//! duplicated.

use std::sync::Arc;

use super::cancel::CancelSignal;
use super::provider::ChatProvider;
use super::types::{ChatMessage, ChatRequest};
use crate::core::config::CoreConfig;
use crate::rag::context::build_context_block;
use crate::rag::retriever::Retriever;
use crate::rag::types::Reference;

#[derive(Debug, Clone, PartialEq)]
pub enum Finish {
    Complete,
    Cancelled,
    Failed(String),
}

/// The settled result of one completion call. `text` holds whatever streamed
/// before the terminal state, so partial output survives both cancellation
/// and mid-stream transport failure.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub text: String,
    pub references: Vec<Reference>,
    pub tokens_generated: u64,
    pub finish: Finish,
}

impl CompletionOutcome {
    fn empty(references: Vec<Reference>, finish: Finish) -> Self {
        Self {
            text: String::new(),
            references,
            tokens_generated: 0,
            finish,
        }
    }
}

pub struct CompletionClient {
    provider: Arc<dyn ChatProvider>,
    retriever: Arc<Retriever>,
    model: String,
    streaming: bool,
    top_k: usize,
}

impl CompletionClient {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        retriever: Arc<Retriever>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            provider,
            retriever,
            model: config.api.model.clone(),
            streaming: config.api.streaming,
            top_k: config.retrieval.max_documents,
        }
    }

    /// Plain completion over the session history. References are always
    /// empty.
    pub async fn complete_plain<F>(
        &self,
        history: &[ChatMessage],
        on_token: F,
        cancel: CancelSignal,
    ) -> CompletionOutcome
    where
        F: FnMut(&str) + Send,
    {
        self.run(history.to_vec(), Vec::new(), on_token, cancel)
            .await
    }

    /// RAG completion: retrieve references for `query` first, inject the
    /// chunk contents as a context block, then stream. The references ride
    /// along in the outcome even when the stream fails or is cancelled.
    pub async fn complete_rag<F>(
        &self,
        query: &str,
        history: &[ChatMessage],
        tags: &[String],
        on_token: F,
        cancel: CancelSignal,
    ) -> CompletionOutcome
    where
        F: FnMut(&str) + Send,
    {
        if cancel.is_cancelled() {
            return CompletionOutcome::empty(Vec::new(), Finish::Cancelled);
        }

        let references = self.retriever.retrieve(query, tags, self.top_k).await;

        if cancel.is_cancelled() {
            return CompletionOutcome::empty(references, Finish::Cancelled);
        }

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ChatMessage::new("system", build_context_block(&references)));
        messages.extend(history.iter().cloned());

        self.run(messages, references, on_token, cancel).await
    }

    async fn run<F>(
        &self,
        messages: Vec<ChatMessage>,
        references: Vec<Reference>,
        mut on_token: F,
        mut cancel: CancelSignal,
    ) -> CompletionOutcome
    where
        F: FnMut(&str) + Send,
    {
        let request = ChatRequest::new(messages);

        if cancel.is_cancelled() {
            return CompletionOutcome::empty(references, Finish::Cancelled);
        }

        if !self.streaming {
            return self.run_buffered(request, references, on_token, cancel).await;
        }

        let mut rx = match self
            .provider
            .stream_chat(request, &self.model, cancel.clone())
            .await
        {
            Ok(rx) => rx,
            Err(e) => return CompletionOutcome::empty(references, Finish::Failed(e.to_string())),
        };

        let mut text = String::new();
        let mut tokens_generated = 0u64;

        let finish = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Finish::Cancelled,
                item = rx.recv() => match item {
                    None => break Finish::Complete,
                    Some(Ok(token)) => {
                        if token.is_empty() {
                            continue;
                        }
                        tokens_generated += 1;
                        text.push_str(&token);
                        on_token(&token);
                    }
                    Some(Err(e)) => break Finish::Failed(e.to_string()),
                }
            }
        };

        CompletionOutcome {
            text,
            references,
            tokens_generated,
            finish,
        }
    }

    /// `streaming = false`: buffer the whole response, then deliver it as a
    /// single token callback.
    async fn run_buffered<F>(
        &self,
        request: ChatRequest,
        references: Vec<Reference>,
        mut on_token: F,
        mut cancel: CancelSignal,
    ) -> CompletionOutcome
    where
        F: FnMut(&str) + Send,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => CompletionOutcome::empty(references, Finish::Cancelled),
            result = self.provider.chat(request, &self.model) => match result {
                Ok(text) => {
                    if !text.is_empty() {
                        on_token(&text);
                    }
                    let tokens_generated = u64::from(!text.is_empty());
                    CompletionOutcome {
                        text,
                        references,
                        tokens_generated,
                        finish: Finish::Complete,
                    }
                }
                Err(e) => CompletionOutcome::empty(references, Finish::Failed(e.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use crate::core::errors::CoreError;
    use crate::llm::cancel::cancel_channel;
    use crate::rag::backend::BackendRegistry;

    /// Scripted provider: emits preset tokens with a delay, optionally
    /// failing after a given number of tokens. Captures the last request.
    struct ScriptedProvider {
        tokens: Vec<String>,
        delay: Duration,
        fail_after: Option<usize>,
        last_messages: Mutex<Vec<ChatMessage>>,
    }

    impl ScriptedProvider {
        fn new(tokens: &[&str]) -> Self {
            Self {
                tokens: tokens.iter().map(|t| t.to_string()).collect(),
                delay: Duration::from_millis(1),
                fail_after: None,
                last_messages: Mutex::new(Vec::new()),
            }
        }

        fn failing_after(mut self, count: usize) -> Self {
            self.fail_after = Some(count);
            self
        }
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn health_check(&self) -> Result<bool, CoreError> {
            Ok(true)
        }

        async fn chat(&self, request: ChatRequest, _model_id: &str) -> Result<String, CoreError> {
            *self.last_messages.lock().unwrap() = request.messages;
            if self.fail_after == Some(0) {
                return Err(CoreError::CompletionTransport("connection reset".into()));
            }
            Ok(self.tokens.concat())
        }

        async fn stream_chat(
            &self,
            request: ChatRequest,
            _model_id: &str,
            cancel: CancelSignal,
        ) -> Result<mpsc::Receiver<Result<String, CoreError>>, CoreError> {
            *self.last_messages.lock().unwrap() = request.messages;

            let (tx, rx) = mpsc::channel(8);
            let tokens = self.tokens.clone();
            let delay = self.delay;
            let fail_after = self.fail_after;

            tokio::spawn(async move {
                let mut cancel = cancel;
                for (i, token) in tokens.into_iter().enumerate() {
                    if fail_after == Some(i) {
                        let _ = tx
                            .send(Err(CoreError::CompletionTransport("connection reset".into())))
                            .await;
                        return;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if tx.send(Ok(token)).await.is_err() {
                        return;
                    }
                }
            });

            Ok(rx)
        }

        async fn embed(
            &self,
            _inputs: &[String],
            _model_id: &str,
        ) -> Result<Vec<Vec<f32>>, CoreError> {
            Ok(vec![vec![1.0, 0.0, 0.0]])
        }
    }

    fn client_with(provider: Arc<ScriptedProvider>, streaming: bool) -> CompletionClient {
        let mut config = CoreConfig::default();
        config.api.streaming = streaming;
        let retriever = Arc::new(Retriever::new(
            provider.clone(),
            Arc::new(BackendRegistry::new()),
            &config,
        ));
        CompletionClient::new(provider, retriever, &config)
    }

    fn history(text: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::new("user", text)]
    }

    #[tokio::test]
    async fn plain_completion_streams_all_tokens() {
        let provider = Arc::new(ScriptedProvider::new(&["Hel", "lo", "!"]));
        let client = client_with(provider, true);
        let (_handle, signal) = cancel_channel();

        let mut seen = Vec::new();
        let outcome = client
            .complete_plain(&history("hi"), |t| seen.push(t.to_string()), signal)
            .await;

        assert_eq!(outcome.finish, Finish::Complete);
        assert_eq!(outcome.text, "Hello!");
        assert_eq!(outcome.tokens_generated, 3);
        assert!(outcome.references.is_empty());
        assert_eq!(seen.join(""), "Hello!");
    }

    #[tokio::test]
    async fn cancellation_is_terminal_not_error() {
        let provider = Arc::new(ScriptedProvider::new(&["a"; 50]));
        let client = client_with(provider, true);
        let (handle, signal) = cancel_channel();

        handle.cancel();
        let outcome = client
            .complete_plain(&history("hi"), |_| {}, signal)
            .await;

        assert_eq!(outcome.finish, Finish::Cancelled);
        assert!(outcome.text.is_empty());
        assert_eq!(outcome.tokens_generated, 0);
    }

    #[tokio::test]
    async fn failure_before_first_token_preserves_nothing_but_references() {
        let provider = Arc::new(ScriptedProvider::new(&["never"]).failing_after(0));
        let client = client_with(provider, true);
        let (_handle, signal) = cancel_channel();

        let outcome = client
            .complete_plain(&history("hi"), |_| {}, signal)
            .await;

        assert!(matches!(outcome.finish, Finish::Failed(_)));
        assert!(outcome.text.is_empty());
        assert_eq!(outcome.tokens_generated, 0);
    }

    #[tokio::test]
    async fn mid_stream_failure_preserves_partial_text() {
        let provider = Arc::new(ScriptedProvider::new(&["par", "tial", "lost"]).failing_after(2));
        let client = client_with(provider, true);
        let (_handle, signal) = cancel_channel();

        let outcome = client
            .complete_plain(&history("hi"), |_| {}, signal)
            .await;

        assert!(matches!(outcome.finish, Finish::Failed(_)));
        assert_eq!(outcome.text, "partial");
        assert_eq!(outcome.tokens_generated, 2);
    }

    #[tokio::test]
    async fn rag_with_no_backends_still_issues_rag_turn() {
        let provider = Arc::new(ScriptedProvider::new(&["ok"]));
        let client = client_with(provider.clone(), true);
        let (_handle, signal) = cancel_channel();

        let outcome = client
            .complete_rag("question", &history("question"), &["manual".into()], |_| {}, signal)
            .await;

        assert_eq!(outcome.finish, Finish::Complete);
        assert!(outcome.references.is_empty());

        // The prompt still carries an explicit empty-context system block.
        let messages = provider.last_messages.lock().unwrap().clone();
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("No relevant documents"));
        assert_eq!(messages.last().unwrap().content, "question");
    }

    #[tokio::test]
    async fn buffered_mode_delivers_single_token() {
        let provider = Arc::new(ScriptedProvider::new(&["all ", "at ", "once"]));
        let client = client_with(provider, false);
        let (_handle, signal) = cancel_channel();

        let mut calls = 0;
        let outcome = client
            .complete_plain(&history("hi"), |_| calls += 1, signal)
            .await;

        assert_eq!(outcome.finish, Finish::Complete);
        assert_eq!(outcome.text, "all at once");
        assert_eq!(calls, 1);
        assert_eq!(outcome.tokens_generated, 1);
    }
}

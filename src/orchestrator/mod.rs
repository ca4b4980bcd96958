//! The turn state machine.
//!
//! One turn runs `Dispatched → Streaming → Finalizing` (with `Cancelling`
//! between `Streaming` and `Finalizing` on a user stop), persisting the user
//! message up front and the assistant message exactly once at finalization.
//! A session has at most one active turn; a second send while one is running
//! is a no-op, not queued.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::core::config::{CoreConfig, EmptyBackendPolicy};
use crate::core::errors::CoreError;
use crate::llm::cancel::{cancel_channel, CancelHandle, CancelSignal};
use crate::llm::completion::{CompletionClient, Finish};
use crate::llm::types::ChatMessage;
use crate::notify::{NotificationChannel, TurnEvent};
use crate::rag::backend::BackendRegistry;
use crate::rag::types::Reference;
use crate::store::chunks::ChunkStore;
use crate::store::sessions::{Message, Sender, Session, SessionStore, TurnMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Dispatched,
    Streaming,
    Cancelling,
    Finalizing,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// The turn finalized; the assistant message is persisted.
    Completed(Message),
    /// Another turn is active for this session; nothing was done.
    Busy,
}

struct ActiveTurn {
    state: TurnState,
    cancel: CancelHandle,
}

pub struct TurnOrchestrator {
    sessions: Arc<SessionStore>,
    chunks: Arc<ChunkStore>,
    completion: Arc<CompletionClient>,
    registry: Arc<BackendRegistry>,
    notify: Arc<NotificationChannel>,
    empty_backend_policy: EmptyBackendPolicy,
    active: Mutex<HashMap<String, ActiveTurn>>,
}

impl TurnOrchestrator {
    pub fn new(
        sessions: Arc<SessionStore>,
        chunks: Arc<ChunkStore>,
        completion: Arc<CompletionClient>,
        registry: Arc<BackendRegistry>,
        notify: Arc<NotificationChannel>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            sessions,
            chunks,
            completion,
            registry,
            notify,
            empty_backend_policy: config.retrieval.empty_backend_policy,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Run one turn to completion. Returns once the turn is back at idle —
    /// tokens stream out through the notification channel in the meantime.
    pub async fn send(&self, session_id: &str, text: &str) -> Result<SendOutcome, CoreError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CoreError::Validation("empty message".to_string()));
        }

        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::Validation(format!("no session {session_id}")))?;

        // Reentrancy guard: at most one active turn per session.
        let cancel_signal;
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(session_id) {
                tracing::debug!("send ignored, session {} already has a turn", session_id);
                return Ok(SendOutcome::Busy);
            }
            let (handle, signal) = cancel_channel();
            cancel_signal = signal;
            active.insert(
                session_id.to_string(),
                ActiveTurn {
                    state: TurnState::Dispatched,
                    cancel: handle,
                },
            );
        }

        let result = self.run_turn(&session, text, cancel_signal).await;

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);

        result
    }

    /// Request cancellation of the session's active turn. Finalization still
    /// happens exactly once through the normal completion path.
    pub fn stop(&self, session_id: &str) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get_mut(session_id) {
            Some(turn) if matches!(turn.state, TurnState::Dispatched | TurnState::Streaming) => {
                turn.state = TurnState::Cancelling;
                turn.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Current state of the session's active turn; `None` means idle.
    pub fn turn_state(&self, session_id: &str) -> Option<TurnState> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .map(|turn| turn.state)
    }

    async fn run_turn(
        &self,
        session: &Session,
        text: &str,
        cancel: CancelSignal,
    ) -> Result<SendOutcome, CoreError> {
        // Dispatched: the user message is durable before anything else runs.
        // Insert first — a failed insert must not advance the session's
        // message list.
        let user_message = Message::user(text);
        self.sessions.insert_message(&user_message).await?;
        self.sessions
            .append_message(&session.id, &user_message.id)
            .await?;

        if session.title.is_none() {
            if let Err(e) = self
                .sessions
                .update_session_title(&session.id, &title_preview(text))
                .await
            {
                tracing::warn!("failed to set session title: {}", e);
            }
        }

        self.notify.publish(TurnEvent::TurnStarted {
            session_id: session.id.clone(),
            user_message: user_message.clone(),
        });

        // History comes from the store, not a cache, so a restart between
        // turns cannot diverge from what is persisted.
        let history = self.load_history(&session.id).await?;

        let notify = self.notify.clone();
        let session_id = session.id.clone();
        let on_token = move |token: &str| {
            notify.publish(TurnEvent::Token {
                session_id: session_id.clone(),
                token: token.to_string(),
            });
        };

        let started_at = Utc::now();
        self.mark_streaming(&session.id);

        let outcome = if self.use_rag(&session.document_tags) {
            self.completion
                .complete_rag(text, &history, &session.document_tags, on_token, cancel)
                .await
        } else {
            self.completion
                .complete_plain(&history, on_token, cancel)
                .await
        };

        // Transport failure with zero tokens: nothing is persisted beyond
        // the user message.
        if let Finish::Failed(reason) = &outcome.finish {
            if outcome.tokens_generated == 0 {
                tracing::error!("turn failed before any token arrived: {}", reason);
                self.notify.publish(TurnEvent::Failed {
                    session_id: session.id.clone(),
                    error: reason.clone(),
                });
                return Err(CoreError::CompletionTransport(reason.clone()));
            }
        }

        self.mark_finalizing(&session.id);
        let finished_at = Utc::now();
        let failure = match &outcome.finish {
            Finish::Failed(reason) => Some(reason.clone()),
            _ => None,
        };

        let references = self.resolve_references(outcome.references).await;
        let assistant = Message {
            id: uuid::Uuid::new_v4().to_string(),
            sender: Sender::Assistant,
            text: outcome.text,
            timestamp: finished_at.to_rfc3339(),
            document_references: references,
            embedding: None,
            metrics: Some(build_metrics(
                started_at,
                finished_at,
                outcome.tokens_generated,
            )),
        };

        self.sessions.insert_message(&assistant).await?;
        self.sessions
            .append_message(&session.id, &assistant.id)
            .await?;

        self.notify.publish(TurnEvent::Completed {
            session_id: session.id.clone(),
            message: assistant.clone(),
        });

        // A mid-stream failure still finalizes the partial text, but the
        // error is surfaced rather than silently reported as success.
        if let Some(reason) = failure {
            self.notify.publish(TurnEvent::Failed {
                session_id: session.id.clone(),
                error: reason.clone(),
            });
            return Err(CoreError::CompletionTransport(reason));
        }

        Ok(SendOutcome::Completed(assistant))
    }

    fn use_rag(&self, tags: &[String]) -> bool {
        if tags.is_empty() {
            return false;
        }
        if !self.registry.enabled_for_tags(tags).is_empty() {
            return true;
        }
        self.empty_backend_policy == EmptyBackendPolicy::Rag
    }

    async fn load_history(&self, session_id: &str) -> Result<Vec<ChatMessage>, CoreError> {
        let session = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("session {session_id}")))?;
        let messages = self.sessions.list_messages(&session.message_ids).await?;

        Ok(messages
            .into_iter()
            .map(|m| ChatMessage {
                role: m.sender.as_str().to_string(),
                content: m.text,
            })
            .collect())
    }

    /// Two-tier lazy content resolution: primary lookup by chunk id, then
    /// fallback by `(document_id, chunk_index)`. A chunk that resolves
    /// through neither is kept with unavailable content, never dropped.
    async fn resolve_references(&self, references: Vec<Reference>) -> Vec<Reference> {
        let mut resolved = Vec::with_capacity(references.len());
        for mut reference in references {
            if reference.content.is_none() {
                reference.content = self.lookup_content(&reference).await;
            }
            resolved.push(reference);
        }
        resolved
    }

    async fn lookup_content(&self, reference: &Reference) -> Option<String> {
        match self.chunks.get_chunk(&reference.chunk_id).await {
            Ok(Some(chunk)) => return Some(chunk.content),
            Ok(None) => {}
            Err(e) => tracing::warn!("chunk lookup failed for {}: {}", reference.chunk_id, e),
        }

        if let Some(index) = reference.chunk_index {
            match self
                .chunks
                .find_chunks_by_document(&reference.document_id, Some(index))
                .await
            {
                Ok(chunks) => {
                    if let Some(chunk) = chunks.into_iter().next() {
                        return Some(chunk.content);
                    }
                }
                Err(e) => tracing::warn!(
                    "fallback chunk lookup failed for {}/{}: {}",
                    reference.document_id,
                    index,
                    e
                ),
            }
        }

        tracing::warn!("reference content unavailable for chunk {}", reference.chunk_id);
        None
    }

    fn mark_streaming(&self, session_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(turn) = active.get_mut(session_id) {
            // A stop raised during dispatch wins over the transition.
            if turn.state == TurnState::Dispatched {
                turn.state = TurnState::Streaming;
            }
        }
    }

    fn mark_finalizing(&self, session_id: &str) {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(turn) = active.get_mut(session_id) {
            turn.state = TurnState::Finalizing;
        }
    }
}

fn title_preview(text: &str) -> String {
    let mut preview: String = text.chars().take(48).collect();
    if text.chars().count() > 48 {
        preview.push('…');
    }
    preview
}

fn build_metrics(start: DateTime<Utc>, end: DateTime<Utc>, tokens_generated: u64) -> TurnMetrics {
    let elapsed = (end - start).num_milliseconds().max(0) as f64 / 1000.0;
    let tokens_per_second = if tokens_generated > 0 && elapsed > 0.0 {
        tokens_generated as f64 / elapsed
    } else {
        0.0
    };

    TurnMetrics {
        start_time: start.to_rfc3339(),
        end_time: end.to_rfc3339(),
        tokens_generated,
        tokens_per_second,
    }
}

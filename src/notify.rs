//! Publish/subscribe channel for turn events.
//!
//! The UI layer subscribes here; the orchestrator publishes. Deliberately
//! decoupled from the storage layer — events describe what happened, the
//! stores remain the source of truth.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::store::sessions::Message;

#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A turn was dispatched; the user message is already persisted.
    TurnStarted {
        session_id: String,
        user_message: Message,
    },
    /// One streamed token delta, forwarded verbatim.
    Token { session_id: String, token: String },
    /// The turn finalized; the assistant message is persisted.
    Completed {
        session_id: String,
        message: Message,
    },
    /// The turn failed. The user message stays persisted so a retry keeps
    /// its context.
    Failed { session_id: String, error: String },
}

pub struct NotificationChannel {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TurnEvent>>>,
}

impl NotificationChannel {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TurnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are pruned.
    pub fn publish(&self, event: TurnEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for NotificationChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_all_subscribers() {
        let channel = NotificationChannel::new();
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();

        channel.publish(TurnEvent::Token {
            session_id: "s1".into(),
            token: "hi".into(),
        });

        for rx in [&mut a, &mut b] {
            match rx.recv().await {
                Some(TurnEvent::Token { token, .. }) => assert_eq!(token, "hi"),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn dead_subscribers_are_pruned() {
        let channel = NotificationChannel::new();
        let rx = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 1);

        drop(rx);
        channel.publish(TurnEvent::Failed {
            session_id: "s1".into(),
            error: "x".into(),
        });
        assert_eq!(channel.subscriber_count(), 0);
    }
}

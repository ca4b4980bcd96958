//! SQLite-backed session store.
//!
//! Two durable collections: `sessions` and `messages`. A session references
//! messages by id through the `session_messages` join table, whose `seq`
//! column is the append-only message order — replay order is insertion
//! order, never timestamps.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::core::config::AppPaths;
use crate::core::errors::CoreError;
use crate::rag::types::Reference;

use super::chunks::ChunkStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Assistant => "assistant",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "assistant" => Sender::Assistant,
            _ => Sender::User,
        }
    }
}

/// Timing captured at stream start/end; everything else is derived from the
/// in-memory accumulator at finalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub start_time: String,
    pub end_time: String,
    pub tokens_generated: u64,
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: Sender,
    pub text: String,
    pub timestamp: String,
    #[serde(default)]
    pub document_references: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<TurnMetrics>,
}

impl Message {
    pub fn user(text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender: Sender::User,
            text: text.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            document_references: Vec::new(),
            embedding: None,
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: String,
    pub last_updated: String,
    pub title: Option<String>,
    pub message_ids: Vec<String>,
    pub document_tags: Vec<String>,
}

#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

impl SessionStore {
    pub async fn new(paths: &AppPaths) -> Result<Self, CoreError> {
        Self::with_path(paths.session_db_path.clone()).await
    }

    pub async fn with_path(db_path: PathBuf) -> Result<Self, CoreError> {
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(CoreError::persistence)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), CoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                title TEXT,
                created_at TEXT NOT NULL,
                last_updated TEXT NOT NULL,
                document_tags TEXT NOT NULL DEFAULT '[]'
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender TEXT NOT NULL,
                text TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                document_references TEXT NOT NULL DEFAULT '[]',
                embedding BLOB,
                metrics TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_messages (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                message_id TEXT NOT NULL,
                PRIMARY KEY (session_id, seq),
                FOREIGN KEY(session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        Ok(())
    }

    pub async fn create_session(
        &self,
        title: Option<String>,
        document_tags: Vec<String>,
    ) -> Result<Session, CoreError> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            last_updated: chrono::Utc::now().to_rfc3339(),
            title,
            message_ids: Vec::new(),
            document_tags,
        };

        let tags_json =
            serde_json::to_string(&session.document_tags).map_err(CoreError::persistence)?;

        sqlx::query(
            "INSERT INTO sessions (id, title, created_at, last_updated, document_tags)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(&session.created_at)
        .bind(&session.last_updated)
        .bind(&tags_json)
        .execute(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>, CoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::persistence)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let message_ids = self.message_ids(session_id).await?;
        let tags_json: String = row.get("document_tags");

        Ok(Some(Session {
            id: row.get("id"),
            created_at: row.get("created_at"),
            last_updated: row.get("last_updated"),
            title: row.get("title"),
            message_ids,
            document_tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        }))
    }

    pub async fn list_sessions(&self) -> Result<Vec<Session>, CoreError> {
        let rows = sqlx::query("SELECT id FROM sessions ORDER BY last_updated DESC LIMIT 100")
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::persistence)?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            if let Some(session) = self.get_session(&id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    async fn message_ids(&self, session_id: &str) -> Result<Vec<String>, CoreError> {
        let rows = sqlx::query(
            "SELECT message_id FROM session_messages WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        Ok(rows.iter().map(|row| row.get("message_id")).collect())
    }

    /// Atomically append a message id to the session's ordered list and bump
    /// `last_updated`. Fails with `NotFound` when the session does not exist.
    pub async fn append_message(
        &self,
        session_id: &str,
        message_id: &str,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await.map_err(CoreError::persistence)?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM sessions WHERE id = ?1")
            .bind(session_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(CoreError::persistence)?;
        if exists.is_none() {
            return Err(CoreError::NotFound(format!("session {session_id}")));
        }

        sqlx::query(
            "INSERT INTO session_messages (session_id, seq, message_id)
             VALUES (?1, (SELECT COALESCE(MAX(seq) + 1, 0) FROM session_messages WHERE session_id = ?1), ?2)",
        )
        .bind(session_id)
        .bind(message_id)
        .execute(&mut *tx)
        .await
        .map_err(CoreError::persistence)?;

        sqlx::query("UPDATE sessions SET last_updated = ?1 WHERE id = ?2")
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(CoreError::persistence)?;

        tx.commit().await.map_err(CoreError::persistence)?;
        Ok(())
    }

    pub async fn insert_message(&self, message: &Message) -> Result<(), CoreError> {
        let references_json =
            serde_json::to_string(&message.document_references).map_err(CoreError::persistence)?;
        let metrics_json = message
            .metrics
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(CoreError::persistence)?;
        let embedding_blob = message
            .embedding
            .as_ref()
            .map(|e| ChunkStore::serialize_embedding(e));

        sqlx::query(
            "INSERT INTO messages (id, sender, text, timestamp, document_references, embedding, metrics)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&message.id)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(&message.timestamp)
        .bind(&references_json)
        .bind(embedding_blob)
        .bind(metrics_json)
        .execute(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        Ok(())
    }

    /// Replace a persisted message's text, leaving everything else intact.
    pub async fn update_message_text(
        &self,
        message_id: &str,
        new_text: &str,
    ) -> Result<(), CoreError> {
        let result = sqlx::query("UPDATE messages SET text = ?1 WHERE id = ?2")
            .bind(new_text)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(CoreError::persistence)?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("message {message_id}")));
        }
        Ok(())
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>, CoreError> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(CoreError::persistence)?;

        Ok(row.as_ref().map(row_to_message))
    }

    /// Messages in the order of the supplied ids. Ids that no longer resolve
    /// are skipped with a warning rather than failing the whole read.
    pub async fn list_messages(&self, ids: &[String]) -> Result<Vec<Message>, CoreError> {
        let mut messages = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_message(id).await? {
                Some(message) => messages.push(message),
                None => tracing::warn!("message {} referenced by session but missing", id),
            }
        }
        Ok(messages)
    }

    pub async fn update_session_title(
        &self,
        session_id: &str,
        title: &str,
    ) -> Result<(), CoreError> {
        sqlx::query("UPDATE sessions SET title = ?1, last_updated = ?2 WHERE id = ?3")
            .bind(title)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(CoreError::persistence)?;
        Ok(())
    }

    pub async fn set_document_tags(
        &self,
        session_id: &str,
        tags: Vec<String>,
    ) -> Result<(), CoreError> {
        let tags_json = serde_json::to_string(&tags).map_err(CoreError::persistence)?;
        sqlx::query("UPDATE sessions SET document_tags = ?1, last_updated = ?2 WHERE id = ?3")
            .bind(&tags_json)
            .bind(chrono::Utc::now().to_rfc3339())
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(CoreError::persistence)?;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(CoreError::persistence)?;
        Ok(())
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Message {
    let sender: String = row.get("sender");
    let references_json: String = row.get("document_references");
    let metrics_json: Option<String> = row.get("metrics");
    let embedding_blob: Option<Vec<u8>> = row.get("embedding");

    Message {
        id: row.get("id"),
        sender: Sender::parse(&sender),
        text: row.get("text"),
        timestamp: row.get("timestamp"),
        document_references: serde_json::from_str(&references_json).unwrap_or_default(),
        embedding: embedding_blob
            .as_deref()
            .map(ChunkStore::deserialize_embedding),
        metrics: metrics_json.and_then(|m| serde_json::from_str(&m).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SessionStore {
        let tmp = std::env::temp_dir().join(format!("parley-sessions-{}.db", uuid::Uuid::new_v4()));
        SessionStore::with_path(tmp).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_get_session() {
        let store = test_store().await;
        let session = store
            .create_session(Some("Trip notes".into()), vec!["manual".into()])
            .await
            .unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.title.as_deref(), Some("Trip notes"));
        assert_eq!(loaded.document_tags, vec!["manual"]);
        assert!(loaded.message_ids.is_empty());
        assert!(store.get_session("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn append_preserves_insertion_order() {
        let store = test_store().await;
        let session = store.create_session(None, vec![]).await.unwrap();

        // Same timestamp on purpose: ordering must come from seq, not time.
        let timestamp = chrono::Utc::now().to_rfc3339();
        for text in ["first", "second", "third"] {
            let mut message = Message::user(text);
            message.timestamp = timestamp.clone();
            store.insert_message(&message).await.unwrap();
            store.append_message(&session.id, &message.id).await.unwrap();
        }

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.message_ids.len(), 3);

        let messages = store.list_messages(&loaded.message_ids).await.unwrap();
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn append_to_missing_session_is_not_found() {
        let store = test_store().await;
        let message = Message::user("orphan");
        store.insert_message(&message).await.unwrap();

        let result = store.append_message("nope", &message.id).await;
        assert!(matches!(result, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn append_bumps_last_updated() {
        let store = test_store().await;
        let session = store.create_session(None, vec![]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let message = Message::user("hi");
        store.insert_message(&message).await.unwrap();
        store.append_message(&session.id, &message.id).await.unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert!(loaded.last_updated > session.last_updated);
    }

    #[tokio::test]
    async fn update_message_text() {
        let store = test_store().await;
        let message = Message::user("draft");
        store.insert_message(&message).await.unwrap();

        store
            .update_message_text(&message.id, "final")
            .await
            .unwrap();
        let loaded = store.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(loaded.text, "final");

        let missing = store.update_message_text("missing", "x").await;
        assert!(matches!(missing, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn message_roundtrip_with_references_and_metrics() {
        let store = test_store().await;
        let mut message = Message::user("with extras");
        message.sender = Sender::Assistant;
        message.document_references = vec![Reference {
            document_id: "d1".into(),
            chunk_id: "c1".into(),
            chunk_index: Some(0),
            document_name: "manual.pdf".into(),
            similarity: 0.92,
            content: Some("chunk text".into()),
        }];
        message.embedding = Some(vec![0.5, -0.5]);
        message.metrics = Some(TurnMetrics {
            start_time: "2026-01-01T00:00:00Z".into(),
            end_time: "2026-01-01T00:00:02Z".into(),
            tokens_generated: 10,
            tokens_per_second: 5.0,
        });

        store.insert_message(&message).await.unwrap();
        let loaded = store.get_message(&message.id).await.unwrap().unwrap();

        assert_eq!(loaded.sender, Sender::Assistant);
        assert_eq!(loaded.document_references.len(), 1);
        assert_eq!(loaded.document_references[0].chunk_id, "c1");
        assert_eq!(loaded.embedding, Some(vec![0.5, -0.5]));
        assert_eq!(loaded.metrics.unwrap().tokens_generated, 10);
    }

    #[tokio::test]
    async fn set_document_tags_roundtrip() {
        let store = test_store().await;
        let session = store.create_session(None, vec![]).await.unwrap();
        store
            .set_document_tags(&session.id, vec!["manual".into(), "specs".into()])
            .await
            .unwrap();

        let loaded = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.document_tags, vec!["manual", "specs"]);
    }
}

//! SQLite-backed chunk store.
//!
//! Durable storage for document chunks and their embeddings. Used for lazy
//! content resolution of references after retrieval, and as the index behind
//! the `local` vector backend (brute-force cosine similarity).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::core::config::AppPaths;
use crate::core::errors::CoreError;

/// A bounded contiguous slice of a source document, the unit of embedding
/// and retrieval. `chunk_index` is unique and contiguous within a document,
/// starting at 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub embedding: Vec<f32>,
    pub document_name: String,
}

/// A chunk scored against a query embedding.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: f32,
}

pub struct ChunkStore {
    pool: SqlitePool,
}

impl ChunkStore {
    pub async fn new(paths: &AppPaths) -> Result<Self, CoreError> {
        Self::with_path(paths.chunk_db_path.clone()).await
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
            "CREATE TABLE IF NOT EXISTS document_chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                document_name TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL DEFAULT (STRFTIME('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(document_id, chunk_index)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document ON document_chunks(document_id)")
            .execute(&self.pool)
            .await
            .map_err(CoreError::persistence)?;

        Ok(())
    }

    pub(crate) fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
        embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    pub(crate) fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> DocumentChunk {
        let embedding_bytes: Vec<u8> = row.get("embedding");
        DocumentChunk {
            id: row.get("id"),
            document_id: row.get("document_id"),
            chunk_index: row.get("chunk_index"),
            content: row.get("content"),
            embedding: Self::deserialize_embedding(&embedding_bytes),
            document_name: row.get("document_name"),
        }
    }

    pub async fn insert_chunk(&self, chunk: &DocumentChunk) -> Result<(), CoreError> {
        let blob = Self::serialize_embedding(&chunk.embedding);

        sqlx::query(
            "INSERT OR REPLACE INTO document_chunks
                (id, document_id, chunk_index, content, embedding, document_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.content)
        .bind(&blob)
        .bind(&chunk.document_name)
        .execute(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        Ok(())
    }

    pub async fn get_chunk(&self, chunk_id: &str) -> Result<Option<DocumentChunk>, CoreError> {
        let row = sqlx::query(
            "SELECT id, document_id, chunk_index, content, embedding, document_name
             FROM document_chunks
             WHERE id = ?1",
        )
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        Ok(row.as_ref().map(Self::row_to_chunk))
    }

    /// Chunks of a document ordered by `chunk_index`; an index narrows the
    /// result to that single chunk. This is the fallback lookup used when a
    /// reference's chunk id no longer resolves.
    pub async fn find_chunks_by_document(
        &self,
        document_id: &str,
        chunk_index: Option<i64>,
    ) -> Result<Vec<DocumentChunk>, CoreError> {
        let rows = if let Some(index) = chunk_index {
            sqlx::query(
                "SELECT id, document_id, chunk_index, content, embedding, document_name
                 FROM document_chunks
                 WHERE document_id = ?1 AND chunk_index = ?2
                 ORDER BY chunk_index ASC",
            )
            .bind(document_id)
            .bind(index)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::persistence)?
        } else {
            sqlx::query(
                "SELECT id, document_id, chunk_index, content, embedding, document_name
                 FROM document_chunks
                 WHERE document_id = ?1
                 ORDER BY chunk_index ASC",
            )
            .bind(document_id)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::persistence)?
        };

        Ok(rows.iter().map(Self::row_to_chunk).collect())
    }

    /// Brute-force cosine search over every stored chunk, highest score
    /// first. Chunks without an embedding are skipped.
    pub async fn search_similar(
        &self,
        query_embedding: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredChunk>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_index, content, embedding, document_name
             FROM document_chunks",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(CoreError::persistence)?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .filter_map(|row| {
                let embedding_bytes: Vec<u8> = row.get("embedding");
                if embedding_bytes.is_empty() {
                    return None;
                }
                let stored = Self::deserialize_embedding(&embedding_bytes);
                let score = cosine_similarity(query_embedding, &stored);
                Some(ScoredChunk {
                    chunk: Self::row_to_chunk(row),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(limit.max(1));

        Ok(scored)
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<usize, CoreError> {
        let result = sqlx::query("DELETE FROM document_chunks WHERE document_id = ?1")
            .bind(document_id)
            .execute(&self.pool)
            .await
            .map_err(CoreError::persistence)?;

        Ok(result.rows_affected() as usize)
    }

    pub async fn count(&self) -> Result<usize, CoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(CoreError::persistence)?;

        Ok(count as usize)
    }
}

pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    let denom = norm_a * norm_b;

    if denom <= f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ChunkStore {
        let tmp = std::env::temp_dir().join(format!("parley-chunks-{}.db", uuid::Uuid::new_v4()));
        ChunkStore::with_path(tmp).await.unwrap()
    }

    fn make_chunk(id: &str, doc: &str, index: i64, content: &str, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            document_id: doc.to_string(),
            chunk_index: index,
            content: content.to_string(),
            embedding,
            document_name: format!("{doc}.pdf"),
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let store = test_store().await;
        store
            .insert_chunk(&make_chunk("c1", "d1", 0, "hello world", vec![1.0, 0.0]))
            .await
            .unwrap();

        let chunk = store.get_chunk("c1").await.unwrap().unwrap();
        assert_eq!(chunk.content, "hello world");
        assert_eq!(chunk.embedding, vec![1.0, 0.0]);
        assert!(store.get_chunk("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_chunk_is_idempotent() {
        let store = test_store().await;
        store
            .insert_chunk(&make_chunk("c1", "d1", 0, "stable", vec![1.0]))
            .await
            .unwrap();

        let first = store.get_chunk("c1").await.unwrap().unwrap();
        let second = store.get_chunk("c1").await.unwrap().unwrap();
        assert_eq!(first.content, second.content);
    }

    #[tokio::test]
    async fn find_by_document_orders_by_index() {
        let store = test_store().await;
        store
            .insert_chunk(&make_chunk("c2", "d1", 1, "second", vec![1.0]))
            .await
            .unwrap();
        store
            .insert_chunk(&make_chunk("c1", "d1", 0, "first", vec![1.0]))
            .await
            .unwrap();
        store
            .insert_chunk(&make_chunk("x1", "d2", 0, "other doc", vec![1.0]))
            .await
            .unwrap();

        let chunks = store.find_chunks_by_document("d1", None).await.unwrap();
        let indices: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1]);

        let single = store.find_chunks_by_document("d1", Some(1)).await.unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].content, "second");
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let store = test_store().await;
        store
            .insert_chunk(&make_chunk("low", "d1", 0, "far", vec![0.1, 0.9, 0.0]))
            .await
            .unwrap();
        store
            .insert_chunk(&make_chunk("high", "d1", 1, "near", vec![0.9, 0.1, 0.0]))
            .await
            .unwrap();
        store
            .insert_chunk(&make_chunk("mid", "d1", 2, "between", vec![0.6, 0.4, 0.0]))
            .await
            .unwrap();

        let results = store.search_similar(&[1.0, 0.0, 0.0], 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].chunk.id, "high");
        assert_eq!(results[1].chunk.id, "mid");
        assert!(results[0].score > results[1].score);
    }

    #[tokio::test]
    async fn delete_document_removes_all_chunks() {
        let store = test_store().await;
        store
            .insert_chunk(&make_chunk("c1", "d1", 0, "a", vec![1.0]))
            .await
            .unwrap();
        store
            .insert_chunk(&make_chunk("c2", "d1", 1, "b", vec![1.0]))
            .await
            .unwrap();

        let deleted = store.delete_document("d1").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[test]
    fn embedding_roundtrip() {
        let embedding = vec![0.25_f32, -1.5, 3.75];
        let blob = ChunkStore::serialize_embedding(&embedding);
        assert_eq!(ChunkStore::deserialize_embedding(&blob), embedding);
    }
}

//! PostgreSQL + pgvector adapter.
//!
//! Similarity is computed in SQL as `1 - (embedding <=> query)` so rows come
//! back ranked. The pool connects lazily: an unreachable database surfaces
//! as a retrieval error at query time, not a startup failure.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::core::errors::CoreError;
use crate::rag::backend::{BackendHit, BackendKind, VectorBackend};

pub struct PgVectorBackend {
    pool: PgPool,
    table: String,
}

impl PgVectorBackend {
    pub fn connect_lazy(connection_string: &str, table: &str) -> Result<Self, CoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect_lazy(connection_string)
            .map_err(CoreError::retrieval)?;

        Ok(Self {
            pool,
            table: sanitize_table_name(table),
        })
    }

    fn vector_literal(vector: &[f32]) -> String {
        let values = vector
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("[{values}]")
    }
}

/// Table names cannot be bound as parameters; restrict them to identifier
/// characters before interpolation.
fn sanitize_table_name(table: &str) -> String {
    let cleaned: String = table
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "documents".to_string()
    } else {
        cleaned
    }
}

#[async_trait]
impl VectorBackend for PgVectorBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pgvector
    }

    // The table is fixed per backend config; the collection parameter is
    // accepted for contract uniformity and ignored.
    async fn search(
        &self,
        _collection: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<BackendHit>, CoreError> {
        let sql = format!(
            "SELECT id, metadata, 1 - (embedding <=> $1::vector) AS similarity
             FROM {}
             ORDER BY similarity DESC
             LIMIT $2",
            self.table
        );

        let rows = sqlx::query(&sql)
            .bind(Self::vector_literal(query_vector))
            .bind(top_k as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(CoreError::retrieval)?;

        Ok(rows
            .iter()
            .map(|row| BackendHit {
                id: row.try_get::<String, _>("id").unwrap_or_default(),
                score: row.try_get::<f64, _>("similarity").unwrap_or(0.0) as f32,
                payload: row
                    .try_get::<Value, _>("metadata")
                    .unwrap_or(Value::Null),
            })
            .collect())
    }

    async fn upsert(
        &self,
        _collection: &str,
        id: &str,
        vector: &[f32],
        payload: Value,
    ) -> Result<(), CoreError> {
        let sql = format!(
            "INSERT INTO {} (id, metadata, embedding)
             VALUES ($1, $2, $3::vector)
             ON CONFLICT (id) DO UPDATE
             SET metadata = EXCLUDED.metadata, embedding = EXCLUDED.embedding",
            self.table
        );

        sqlx::query(&sql)
            .bind(id)
            .bind(payload)
            .bind(Self::vector_literal(vector))
            .execute(&self.pool)
            .await
            .map_err(CoreError::retrieval)?;

        Ok(())
    }
}

//! SQLite store for documents, chunks, conversations and usage counters.
//!
//! Chunk embeddings are stored as little-endian f32 blobs and scanned
//! brute-force for cosine similarity; metadata filters are pushed into SQL.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use super::models::{
    Conversation, Document, DocumentChunk, DocumentStatus, UsageRecord,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Document not found: {0}")]
    DocumentNotFound(Uuid),

    #[error("Invalid row data: {0}")]
    InvalidRow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A chunk paired with its cosine similarity against a query embedding.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub similarity: f32,
}

/// Metadata filters applied to a chunk scan.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub user_id: Option<Uuid>,
    pub document_id: Option<Uuid>,
    pub module: Option<String>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                file_name TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                module TEXT NOT NULL,
                status TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                summary TEXT,
                created_at TEXT NOT NULL
            );

            -- user_id, module and file_name are denormalized from documents
            -- at write time so retrieval never joins on the hot path.
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB NOT NULL,
                chunk_index INTEGER NOT NULL,
                module TEXT NOT NULL,
                file_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                module TEXT NOT NULL,
                title TEXT NOT NULL,
                messages TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (user_id, module)
            );

            CREATE TABLE IF NOT EXISTS usage (
                user_id TEXT NOT NULL,
                day TEXT NOT NULL,
                query_count INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                UNIQUE (user_id, day)
            );

            CREATE INDEX IF NOT EXISTS idx_documents_user_id ON documents(user_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_chunks_user_id ON chunks(user_id);
            "#,
        )?;
        Ok(Self { conn })
    }

    // ===== Documents =====

    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        self.conn.execute(
            "INSERT INTO documents (id, user_id, file_name, storage_path, module, status, chunk_count, summary, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                doc.id.to_string(),
                doc.user_id.to_string(),
                doc.file_name,
                doc.storage_path,
                doc.module,
                doc.status.as_str(),
                doc.chunk_count,
                doc.summary,
                doc.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_document(&self, id: Uuid) -> Result<Option<Document>> {
        self.conn
            .query_row(
                "SELECT id, user_id, file_name, storage_path, module, status, chunk_count, summary, created_at
                 FROM documents WHERE id = ?1",
                params![id.to_string()],
                row_to_document,
            )
            .optional()
            .map_err(StoreError::from)
    }

    pub fn list_documents(&self, user_id: Uuid, module: Option<&str>) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, user_id, file_name, storage_path, module, status, chunk_count, summary, created_at
             FROM documents
             WHERE user_id = ?1 AND (?2 IS NULL OR module = ?2)
             ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![user_id.to_string(), module], row_to_document)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
    }

    /// Flip a document's lifecycle status. Last writer wins; only one
    /// ingestion is logically responsible for each document.
    pub fn set_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        chunk_count: u32,
        summary: Option<&str>,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE documents SET status = ?2, chunk_count = ?3, summary = COALESCE(?4, summary)
             WHERE id = ?1",
            params![id.to_string(), status.as_str(), chunk_count, summary],
        )?;
        if updated == 0 {
            return Err(StoreError::DocumentNotFound(id));
        }
        Ok(())
    }

    /// Delete a document; its chunks go with it via the FK cascade.
    pub fn delete_document(&self, id: Uuid) -> Result<()> {
        self.conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    // ===== Chunks =====

    /// Persist a document's chunk rows with their embeddings in one
    /// transaction.
    pub fn insert_chunks(&mut self, chunks: &[DocumentChunk], embeddings: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != embeddings.len() {
            return Err(StoreError::InvalidRow(format!(
                "chunk count ({}) does not match embedding count ({})",
                chunks.len(),
                embeddings.len()
            )));
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (id, document_id, user_id, content, embedding, chunk_index, module, file_name)
                 SELECT ?1, ?2, d.user_id, ?3, ?4, ?5, ?6, ?7 FROM documents d WHERE d.id = ?2",
            )?;
            for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
                let blob: Vec<u8> = embedding.iter().flat_map(|f| f.to_le_bytes()).collect();
                stmt.execute(params![
                    chunk.id.to_string(),
                    chunk.document_id.to_string(),
                    chunk.content,
                    blob,
                    chunk.chunk_index,
                    chunk.module,
                    chunk.file_name,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Remove all chunk rows for a document (partial-ingest cleanup).
    pub fn delete_chunks_for_document(&self, document_id: Uuid) -> Result<()> {
        self.conn.execute(
            "DELETE FROM chunks WHERE document_id = ?1",
            params![document_id.to_string()],
        )?;
        Ok(())
    }

    /// Brute-force cosine scan over the filtered chunk set, best first.
    pub fn vector_scan(
        &self,
        query_embedding: &[f32],
        filter: &ChunkFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, content, embedding, chunk_index, module, file_name
             FROM chunks
             WHERE (?1 IS NULL OR user_id = ?1)
               AND (?2 IS NULL OR document_id = ?2)
               AND (?3 IS NULL OR module = ?3)",
        )?;

        let rows = stmt.query_map(
            params![
                filter.user_id.map(|u| u.to_string()),
                filter.document_id.map(|d| d.to_string()),
                filter.module.as_deref(),
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, document_id, content, blob, chunk_index, module, file_name) = row?;
            let embedding = deserialize_embedding(&blob);
            let similarity = cosine_similarity(query_embedding, &embedding);
            scored.push(ScoredChunk {
                chunk: DocumentChunk {
                    id: parse_uuid(&id)?,
                    document_id: parse_uuid(&document_id)?,
                    content,
                    chunk_index,
                    module,
                    file_name,
                },
                similarity,
            });
        }

        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(scored)
    }

    // ===== Conversations =====

    pub fn get_conversation(&self, user_id: Uuid, module: &str) -> Result<Option<Conversation>> {
        self.conn
            .query_row(
                "SELECT id, user_id, module, title, messages, updated_at
                 FROM conversations WHERE user_id = ?1 AND module = ?2",
                params![user_id.to_string(), module],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?
            .map(|(id, user_id, module, title, messages, updated_at)| {
                Ok(Conversation {
                    id: parse_uuid(&id)?,
                    user_id: parse_uuid(&user_id)?,
                    module,
                    title,
                    messages: serde_json::from_str(&messages)?,
                    updated_at: parse_timestamp(&updated_at)?,
                })
            })
            .transpose()
    }

    /// Upsert a conversation, trimming to the most recent `max_messages`.
    pub fn save_conversation(&self, conversation: &Conversation, max_messages: usize) -> Result<()> {
        let messages = if conversation.messages.len() > max_messages {
            &conversation.messages[conversation.messages.len() - max_messages..]
        } else {
            &conversation.messages[..]
        };
        let messages_json = serde_json::to_string(messages)?;

        self.conn.execute(
            "INSERT INTO conversations (id, user_id, module, title, messages, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, module) DO UPDATE SET
                 title = excluded.title,
                 messages = excluded.messages,
                 updated_at = excluded.updated_at",
            params![
                conversation.id.to_string(),
                conversation.user_id.to_string(),
                conversation.module,
                conversation.title,
                messages_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_conversation(&self, user_id: Uuid, module: &str) -> Result<()> {
        self.conn.execute(
            "DELETE FROM conversations WHERE user_id = ?1 AND module = ?2",
            params![user_id.to_string(), module],
        )?;
        Ok(())
    }

    // ===== Usage =====

    pub fn get_usage(&self, user_id: Uuid, day: &str) -> Result<Option<UsageRecord>> {
        self.conn
            .query_row(
                "SELECT user_id, day, query_count, input_tokens, output_tokens, cost
                 FROM usage WHERE user_id = ?1 AND day = ?2",
                params![user_id.to_string(), day],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, f64>(5)?,
                    ))
                },
            )
            .optional()?
            .map(|(user_id, day, query_count, input_tokens, output_tokens, cost)| {
                Ok(UsageRecord {
                    user_id: parse_uuid(&user_id)?,
                    day,
                    query_count,
                    input_tokens,
                    output_tokens,
                    cost,
                })
            })
            .transpose()
    }

    /// Total estimated cost across all users for one day.
    pub fn total_cost_for_day(&self, day: &str) -> Result<f64> {
        let total: f64 = self.conn.query_row(
            "SELECT COALESCE(SUM(cost), 0) FROM usage WHERE day = ?1",
            params![day],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Atomic increment of a day's counters. Concurrent increments from the
    /// same user must not lose updates, hence the single upsert statement.
    pub fn record_usage(
        &self,
        user_id: Uuid,
        day: &str,
        input_tokens: i64,
        output_tokens: i64,
        cost: f64,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO usage (user_id, day, query_count, input_tokens, output_tokens, cost)
             VALUES (?1, ?2, 1, ?3, ?4, ?5)
             ON CONFLICT (user_id, day) DO UPDATE SET
                 query_count = query_count + 1,
                 input_tokens = input_tokens + excluded.input_tokens,
                 output_tokens = output_tokens + excluded.output_tokens,
                 cost = cost + excluded.cost",
            params![user_id.to_string(), day, input_tokens, output_tokens, cost],
        )?;
        Ok(())
    }
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::InvalidRow(format!("bad uuid {s}: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidRow(format!("bad timestamp {s}: {e}")))
}

fn row_to_document(row: &rusqlite::Row) -> rusqlite::Result<Document> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(8)?;
    Ok(Document {
        id: Uuid::parse_str(&id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        user_id: Uuid::parse_str(&user_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?,
        file_name: row.get(2)?,
        storage_path: row.get(3)?,
        module: row.get(4)?,
        status: DocumentStatus::parse(&status).unwrap_or(DocumentStatus::Error),
        chunk_count: row.get(6)?,
        summary: row.get(7)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    8,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
    })
}

/// Deserialize an embedding from a little-endian f32 blob.
fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot_product = 0.0;
    let mut norm_a = 0.0;
    let mut norm_b = 0.0;

    for (x, y) in a.iter().zip(b.iter()) {
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denominator = (norm_a * norm_b).sqrt();
    if denominator == 0.0 {
        return 0.0;
    }

    dot_product / denominator
}

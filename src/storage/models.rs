//! Data models for documents, chunks, conversations and usage rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an ingested document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Ready,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "processing" => Some(DocumentStatus::Processing),
            "ready" => Some(DocumentStatus::Ready),
            "error" => Some(DocumentStatus::Error),
            _ => None,
        }
    }
}

/// A user-uploaded study document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub user_id: Uuid,
    pub file_name: String,
    /// Object-storage path the raw bytes live under.
    pub storage_path: String,
    /// Free-text grouping tag ("Biology", "Linear Algebra", ...).
    pub module: String,
    pub status: DocumentStatus,
    pub chunk_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Create a new document in the `processing` state.
    pub fn new(user_id: Uuid, file_name: String, storage_path: String, module: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            file_name,
            storage_path,
            module,
            status: DocumentStatus::Processing,
            chunk_count: 0,
            summary: None,
            created_at: Utc::now(),
        }
    }
}

/// A bounded passage of a document, the atomic unit of retrieval.
///
/// `module` and `file_name` are denormalized copies of the owning document's
/// fields, written by the ingestion writer so the hot retrieval path never
/// joins back to the documents table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    /// Zero-based position within the document.
    pub chunk_index: u32,
    pub module: String,
    pub file_name: String,
}

impl DocumentChunk {
    pub fn new(document: &Document, chunk_index: u32, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            document_id: document.id,
            content,
            chunk_index,
            module: document.module.clone(),
            file_name: document.file_name.clone(),
        }
    }
}

/// A chunk reference surfaced to the end user alongside an answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub document_name: String,
    pub chunk_index: u32,
    /// Truncated content preview.
    pub content: String,
    pub similarity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_score: Option<f32>,
}

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A single message within a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<Source>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_confidence: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: String) -> Self {
        Self {
            role: MessageRole::User,
            content,
            sources: None,
            low_confidence: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: String, sources: Vec<Source>, low_confidence: bool) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            sources: if sources.is_empty() { None } else { Some(sources) },
            low_confidence: if low_confidence { Some(true) } else { None },
            timestamp: Utc::now(),
        }
    }
}

/// One conversation thread per (user, module) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: Uuid,
    pub user_id: Uuid,
    pub module: String,
    pub title: String,
    pub messages: Vec<ConversationMessage>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(user_id: Uuid, module: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: format!("{} chat", module),
            module,
            messages: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Per-(user, day) usage counters. Never decremented.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub user_id: Uuid,
    /// Calendar date in the reference timezone, formatted YYYY-MM-DD.
    pub day: String,
    pub query_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// Estimated cost in USD.
    pub cost: f64,
}

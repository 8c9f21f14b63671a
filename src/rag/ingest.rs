//! Document ingestion: fetch, sniff, extract, chunk, embed, persist.
//!
//! The caller gets the Document row back as soon as it exists in the
//! `processing` state; chunking and embedding run as a detached task whose
//! outcome is only visible through the document's status. Failures during
//! the detached phase are logged, flip the status to `error`, and clean up
//! any partially written chunk rows.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::objects::{ObjectError, ObjectStore};
use crate::rag::chunker;
use crate::rag::embedder::{EmbeddingClient, EmbeddingError};
use crate::search::{LexicalIndex, SearchError};
use crate::storage::{Document, DocumentChunk, DocumentStatus, Store, StoreError};

/// Minimum non-whitespace characters worth embedding.
const MIN_CONTENT_CHARS: usize = 50;

/// Character budget for the extractive summary stored on the document.
const SUMMARY_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Source object not found, re-upload required: {0}")]
    SourceNotFound(String),

    #[error("Unsupported media type")]
    UnsupportedMediaType,

    #[error("Extracted text too short to index")]
    InsufficientContent,

    #[error("PDF parse error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Object storage error: {0}")]
    Object(ObjectError),

    #[error("Search index error: {0}")]
    Search(#[from] SearchError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

/// Content type detected from the byte signature, never from the
/// caller-declared MIME type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectedType {
    Pdf,
    Text,
}

/// Sniff the actual content type from the leading bytes.
pub fn detect_type(bytes: &[u8]) -> Result<DetectedType> {
    if bytes.starts_with(b"%PDF-") {
        return Ok(DetectedType::Pdf);
    }
    if std::str::from_utf8(bytes).is_ok() {
        return Ok(DetectedType::Text);
    }
    Err(IngestError::UnsupportedMediaType)
}

/// Extract plain text according to the detected type.
pub fn extract_text(bytes: &[u8], detected: DetectedType) -> Result<String> {
    match detected {
        DetectedType::Pdf => {
            let doc = lopdf::Document::load_mem(bytes)?;
            let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
            Ok(doc.extract_text(&pages)?)
        }
        DetectedType::Text => {
            // detect_type already proved this is valid UTF-8.
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn non_whitespace_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<Mutex<Store>>,
    lexical: Arc<Mutex<LexicalIndex>>,
    objects: Arc<ObjectStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    chunking: ChunkingConfig,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<Mutex<Store>>,
        lexical: Arc<Mutex<LexicalIndex>>,
        objects: Arc<ObjectStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        chunking: ChunkingConfig,
    ) -> Self {
        Self {
            store,
            lexical,
            objects,
            embeddings,
            chunking,
        }
    }

    /// Start ingesting a stored object for a user.
    ///
    /// Validates and extracts synchronously, creates the Document row in the
    /// `processing` state, spawns the embedding phase, and returns
    /// immediately. Callers poll document status for completion.
    pub async fn ingest(
        &self,
        user_id: Uuid,
        file_name: &str,
        module: &str,
        storage_path: &str,
    ) -> Result<Document> {
        let bytes = self.objects.download(storage_path).map_err(|e| match e {
            ObjectError::NotFound(path) => IngestError::SourceNotFound(path),
            other => IngestError::Object(other),
        })?;

        let detected = detect_type(&bytes)?;
        let text = extract_text(&bytes, detected)?;
        if non_whitespace_chars(&text) < MIN_CONTENT_CHARS {
            return Err(IngestError::InsufficientContent);
        }

        let document = Document::new(
            user_id,
            file_name.to_string(),
            storage_path.to_string(),
            module.to_string(),
        );
        {
            let store = self
                .store
                .lock()
                .map_err(|e| IngestError::LockPoisoned(e.to_string()))?;
            store.insert_document(&document)?;
        }

        // Detached embedding phase: runs to completion or failure
        // independent of the request that triggered it.
        let pipeline = self.clone();
        let spawned = document.clone();
        tokio::spawn(async move {
            let document_id = spawned.id;
            if let Err(e) = pipeline.process(spawned, text).await {
                log::error!("Ingestion failed for document {document_id}: {e}");
                pipeline.fail_document(document_id);
            }
        });

        Ok(document)
    }

    /// The embedding+persist phase: chunk, embed in batches, persist chunk
    /// rows with denormalized metadata, index lexically, flip to `ready`.
    pub async fn process(&self, document: Document, text: String) -> Result<()> {
        let passages = chunker::chunk(&text, &self.chunking);
        let chunks: Vec<DocumentChunk> = passages
            .iter()
            .enumerate()
            .map(|(i, content)| DocumentChunk::new(&document, i as u32, content.clone()))
            .collect();

        let embeddings = if passages.is_empty() {
            Vec::new()
        } else {
            self.embeddings.embed(&passages).await?
        };

        {
            let mut store = self
                .store
                .lock()
                .map_err(|e| IngestError::LockPoisoned(e.to_string()))?;
            store.insert_chunks(&chunks, &embeddings)?;
        }
        {
            let mut lexical = self
                .lexical
                .lock()
                .map_err(|e| IngestError::LockPoisoned(e.to_string()))?;
            lexical.index_chunks(&chunks)?;
        }

        let summary = summarize(&text);
        {
            let store = self
                .store
                .lock()
                .map_err(|e| IngestError::LockPoisoned(e.to_string()))?;
            store.set_document_status(
                document.id,
                DocumentStatus::Ready,
                chunks.len() as u32,
                Some(&summary),
            )?;
        }
        log::info!(
            "Document {} ready with {} chunks",
            document.id,
            chunks.len()
        );
        Ok(())
    }

    /// Flip a document to `error` and clean up partial chunk rows. Errors
    /// here are logged only; the triggering request has already returned.
    fn fail_document(&self, document_id: Uuid) {
        let Ok(store) = self.store.lock() else {
            log::error!("Store lock poisoned while failing document {document_id}");
            return;
        };
        if let Err(e) = store.delete_chunks_for_document(document_id) {
            log::error!("Failed to clean up chunks for {document_id}: {e}");
        }
        if let Err(e) = store.set_document_status(document_id, DocumentStatus::Error, 0, None) {
            log::error!("Failed to mark document {document_id} as errored: {e}");
        }
        drop(store);
        if let Ok(mut lexical) = self.lexical.lock() {
            if let Err(e) = lexical.remove_document(document_id) {
                log::error!("Failed to clean up lexical entries for {document_id}: {e}");
            }
        }
    }

    /// Delete a document entirely: rows, lexical entries, stored object.
    pub fn delete_document(&self, document: &Document) -> Result<()> {
        {
            let store = self
                .store
                .lock()
                .map_err(|e| IngestError::LockPoisoned(e.to_string()))?;
            store.delete_document(document.id)?;
        }
        {
            let mut lexical = self
                .lexical
                .lock()
                .map_err(|e| IngestError::LockPoisoned(e.to_string()))?;
            lexical.remove_document(document.id)?;
        }
        self.objects
            .remove(&[document.storage_path.clone()])
            .map_err(IngestError::Object)?;
        Ok(())
    }
}

/// Cheap extractive summary: the leading characters of the text.
fn summarize(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= SUMMARY_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(SUMMARY_CHARS).collect();
    format!("{cut}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubEmbeddings {
        fail: AtomicBool,
    }

    impl StubEmbeddings {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(false),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl EmbeddingClient for StubEmbeddings {
        async fn embed(
            &self,
            texts: &[String],
        ) -> crate::rag::embedder::Result<Vec<Vec<f32>>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbeddingError::Service {
                    status: 503,
                    message: "unavailable".to_string(),
                });
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    fn pipeline_with(
        embeddings: Arc<dyn EmbeddingClient>,
    ) -> (IngestionPipeline, Arc<Mutex<Store>>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let lexical = Arc::new(Mutex::new(
            LexicalIndex::new(dir.path().join("lexical")).unwrap(),
        ));
        let objects = Arc::new(
            ObjectStore::new(dir.path().join("objects"), "secret".to_string()).unwrap(),
        );
        let pipeline = IngestionPipeline::new(
            Arc::clone(&store),
            lexical,
            objects,
            embeddings,
            ChunkingConfig::default(),
        );
        (pipeline, store, dir)
    }

    fn long_text(words: usize) -> String {
        (0..words)
            .map(|i| format!("word{i}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_detect_type() {
        assert_eq!(detect_type(b"%PDF-1.7 rest").unwrap(), DetectedType::Pdf);
        assert_eq!(detect_type(b"plain notes").unwrap(), DetectedType::Text);
        assert!(matches!(
            detect_type(&[0xff, 0xfe, 0x00, 0x80, 0xff]),
            Err(IngestError::UnsupportedMediaType)
        ));
    }

    #[test]
    fn test_caller_mime_is_ignored() {
        // A "PDF" that is actually text sniffs as text.
        let detected = detect_type(b"this claims to be a pdf but is not").unwrap();
        assert_eq!(detected, DetectedType::Text);
    }

    #[tokio::test]
    async fn test_missing_object_is_source_not_found() {
        let (pipeline, _store, _dir) = pipeline_with(StubEmbeddings::ok());
        let err = pipeline
            .ingest(Uuid::new_v4(), "gone.txt", "Biology", "user/gone.txt")
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::SourceNotFound(_)));
    }

    #[tokio::test]
    async fn test_insufficient_content_rejected() {
        let (pipeline, store, _dir) = pipeline_with(StubEmbeddings::ok());
        let user = Uuid::new_v4();
        let path = format!("{user}/tiny.txt");
        pipeline
            .objects
            .upload(&path, b"short", "text/plain")
            .unwrap();

        let err = pipeline
            .ingest(user, "tiny.txt", "Biology", &path)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InsufficientContent));

        // No document row was created.
        assert!(store
            .lock()
            .unwrap()
            .list_documents(user, None)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_process_flips_processing_to_ready() {
        let (pipeline, store, _dir) = pipeline_with(StubEmbeddings::ok());
        let user = Uuid::new_v4();
        let doc = Document::new(
            user,
            "notes.txt".to_string(),
            format!("{user}/notes.txt"),
            "Biology".to_string(),
        );
        store.lock().unwrap().insert_document(&doc).unwrap();
        assert_eq!(
            store.lock().unwrap().get_document(doc.id).unwrap().unwrap().status,
            DocumentStatus::Processing
        );

        pipeline.process(doc.clone(), long_text(2000)).await.unwrap();

        let loaded = store.lock().unwrap().get_document(doc.id).unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Ready);
        assert!((4..=6).contains(&loaded.chunk_count), "{}", loaded.chunk_count);
        assert!(loaded.summary.is_some());
    }

    #[tokio::test]
    async fn test_embedding_failure_ends_in_error_status() {
        let (pipeline, store, _dir) = pipeline_with(StubEmbeddings::failing());
        let user = Uuid::new_v4();
        let doc = Document::new(
            user,
            "notes.txt".to_string(),
            format!("{user}/notes.txt"),
            "Biology".to_string(),
        );
        store.lock().unwrap().insert_document(&doc).unwrap();

        let err = pipeline.process(doc.clone(), long_text(500)).await.unwrap_err();
        assert!(matches!(err, IngestError::Embedding(_)));
        pipeline.fail_document(doc.id);

        let loaded = store.lock().unwrap().get_document(doc.id).unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Error);
        assert_eq!(loaded.chunk_count, 0);
    }

    #[tokio::test]
    async fn test_ingest_end_to_end() {
        let (pipeline, store, _dir) = pipeline_with(StubEmbeddings::ok());
        let user = Uuid::new_v4();
        let path = format!("{user}/notes.txt");
        pipeline
            .objects
            .upload(&path, long_text(1000).as_bytes(), "text/plain")
            .unwrap();

        let document = pipeline
            .ingest(user, "notes.txt", "Biology", &path)
            .await
            .unwrap();
        // The ingest call itself returns a processing document.
        assert_eq!(document.status, DocumentStatus::Processing);

        // Wait for the detached phase to settle.
        for _ in 0..50 {
            let status = store
                .lock()
                .unwrap()
                .get_document(document.id)
                .unwrap()
                .unwrap()
                .status;
            if status != DocumentStatus::Processing {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let loaded = store.lock().unwrap().get_document(document.id).unwrap().unwrap();
        assert_eq!(loaded.status, DocumentStatus::Ready);
        assert!(loaded.chunk_count > 0);
    }

    #[test]
    fn test_summarize_truncates() {
        assert_eq!(summarize("short"), "short");
        let long = "a".repeat(500);
        let summary = summarize(&long);
        assert!(summary.chars().count() <= SUMMARY_CHARS + 1);
    }
}

//! Lexical chunk index backing the keyword half of hybrid retrieval.

use std::path::PathBuf;

use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use thiserror::Error;
use uuid::Uuid;

use crate::storage::DocumentChunk;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Tantivy error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    #[error("Query parse error: {0}")]
    QueryParse(#[from] tantivy::query::QueryParserError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// A lexical match: chunk id plus the raw relevance score.
#[derive(Debug, Clone)]
pub struct LexicalMatch {
    pub chunk_id: Uuid,
    pub score: f32,
}

/// Fields in the chunk index schema.
struct ChunkFields {
    chunk_id: Field,
    document_id: Field,
    content: Field,
}

pub struct LexicalIndex {
    index: Index,
    reader: IndexReader,
    writer: IndexWriter,
    fields: ChunkFields,
}

impl LexicalIndex {
    /// Create or open the index at the given path.
    pub fn new(index_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&index_path)?;

        let mut schema_builder = Schema::builder();
        // STRING keeps the UUIDs as single raw terms, so they are
        // addressable by delete_term.
        let chunk_id = schema_builder.add_text_field("chunk_id", STRING | STORED);
        let document_id = schema_builder.add_text_field("document_id", STRING | STORED);
        let content = schema_builder.add_text_field("content", TEXT);
        let schema = schema_builder.build();

        let index = Index::create_in_dir(&index_path, schema.clone())
            .or_else(|_| Index::open_in_dir(&index_path))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()?;

        // Smaller writer heap; chunk batches are modest.
        let writer = index.writer(50_000_000)?;

        Ok(Self {
            index,
            reader,
            writer,
            fields: ChunkFields {
                chunk_id,
                document_id,
                content,
            },
        })
    }

    /// Index a document's chunks in one commit.
    pub fn index_chunks(&mut self, chunks: &[DocumentChunk]) -> Result<()> {
        for chunk in chunks {
            self.writer.add_document(doc!(
                self.fields.chunk_id => chunk.id.to_string(),
                self.fields.document_id => chunk.document_id.to_string(),
                self.fields.content => chunk.content.clone()
            ))?;
        }
        self.writer.commit()?;
        Ok(())
    }

    /// Remove all of a document's chunks from the index.
    pub fn remove_document(&mut self, document_id: Uuid) -> Result<()> {
        let term = Term::from_field_text(self.fields.document_id, &document_id.to_string());
        self.writer.delete_term(term);
        self.writer.commit()?;
        Ok(())
    }

    /// Search chunk content; returns matched chunk ids with raw scores.
    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<LexicalMatch>> {
        if query_str.trim().is_empty() {
            return Ok(Vec::new());
        }

        // Force commit visibility for freshly indexed chunks.
        self.reader.reload()?;
        let searcher = self.reader.searcher();

        let query_parser = QueryParser::for_index(&self.index, vec![self.fields.content]);
        let query = query_parser.parse_query(query_str)?;
        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut matches = Vec::new();
        for (score, doc_address) in top_docs {
            let retrieved: TantivyDocument = searcher.doc(doc_address)?;
            let chunk_id = retrieved
                .get_first(self.fields.chunk_id)
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok());
            if let Some(chunk_id) = chunk_id {
                matches.push(LexicalMatch { chunk_id, score });
            }
        }

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Document;

    fn chunk_with(doc: &Document, index: u32, content: &str) -> DocumentChunk {
        DocumentChunk::new(doc, index, content.to_string())
    }

    fn test_document() -> Document {
        Document::new(
            Uuid::new_v4(),
            "bio.txt".to_string(),
            "user/bio.txt".to_string(),
            "Biology".to_string(),
        )
    }

    #[test]
    fn test_index_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = LexicalIndex::new(dir.path().to_path_buf()).unwrap();

        let doc = test_document();
        let target = chunk_with(&doc, 0, "mitosis is the process of cell division");
        let other = chunk_with(&doc, 1, "photosynthesis converts light into energy");
        index
            .index_chunks(&[target.clone(), other.clone()])
            .unwrap();

        let matches = index.search("mitosis cell division", 10).unwrap();
        assert!(!matches.is_empty());
        assert_eq!(matches[0].chunk_id, target.id);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let index = LexicalIndex::new(dir.path().to_path_buf()).unwrap();
        assert!(index.search("   ", 10).unwrap().is_empty());
    }

    #[test]
    fn test_remove_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = LexicalIndex::new(dir.path().to_path_buf()).unwrap();

        let doc = test_document();
        index
            .index_chunks(&[chunk_with(&doc, 0, "entropy always increases")])
            .unwrap();
        assert!(!index.search("entropy", 10).unwrap().is_empty());

        index.remove_document(doc.id).unwrap();
        assert!(index.search("entropy", 10).unwrap().is_empty());
    }

    #[test]
    fn test_remove_document_leaves_other_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = LexicalIndex::new(dir.path().to_path_buf()).unwrap();

        let doomed = test_document();
        let kept = test_document();
        let kept_chunk = chunk_with(&kept, 0, "entropy in closed systems");
        index
            .index_chunks(&[chunk_with(&doomed, 0, "entropy always increases")])
            .unwrap();
        index.index_chunks(&[kept_chunk.clone()]).unwrap();

        index.remove_document(doomed.id).unwrap();

        let matches = index.search("entropy", 10).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].chunk_id, kept_chunk.id);
    }
}

//! Hybrid retrieval: vector similarity fused with lexical rank.
//!
//! The primary path fuses a cosine-similarity scan with a lexical-index
//! query; if the lexical side fails it degrades silently to pure cosine.
//! Only the vector scan failing as well surfaces as a retrieval error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::search::LexicalIndex;
use crate::storage::{ChunkFilter, DocumentChunk, Store, StoreError};

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;

/// A chunk retained by retrieval, with its scores.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: DocumentChunk,
    pub similarity: f32,
    /// Fused score, present when the lexical path contributed.
    pub combined_score: Option<f32>,
}

impl RetrievedChunk {
    /// The score the relevance threshold is applied to.
    pub fn relevance(&self) -> f32 {
        self.combined_score.unwrap_or(self.similarity)
    }
}

/// Which low-confidence message variant applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowConfidenceKind {
    /// The candidate set was empty (or effectively noise).
    NoMatches,
    /// Candidates existed but none cleared the threshold.
    WeakMatches,
}

/// Outcome of a retrieval call.
#[derive(Debug)]
pub enum RetrievalOutcome {
    Matches(Vec<RetrievedChunk>),
    LowConfidence(LowConfidenceKind),
}

pub struct HybridRetriever {
    store: Arc<Mutex<Store>>,
    lexical: Arc<Mutex<LexicalIndex>>,
    config: RetrievalConfig,
}

impl HybridRetriever {
    pub fn new(
        store: Arc<Mutex<Store>>,
        lexical: Arc<Mutex<LexicalIndex>>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            lexical,
            config,
        }
    }

    /// Retrieve the best chunks for a query embedding plus optional query
    /// text, under the given metadata filter.
    pub fn retrieve(
        &self,
        query_embedding: &[f32],
        query_text: &str,
        filter: &ChunkFilter,
    ) -> Result<RetrievalOutcome> {
        let candidates = {
            let store = self
                .store
                .lock()
                .map_err(|e| RetrievalError::LockPoisoned(e.to_string()))?;
            store.vector_scan(query_embedding, filter)?
        };

        if candidates.is_empty() {
            return Ok(RetrievalOutcome::LowConfidence(LowConfidenceKind::NoMatches));
        }

        let lexical_scores = self.lexical_scores(query_text, candidates.len());

        // Fuse, order by combined score, and overfetch past the limit so
        // thresholding still leaves enough candidates.
        let mut fused: Vec<RetrievedChunk> = candidates
            .iter()
            .map(|scored| {
                let combined_score = lexical_scores.as_ref().map(|scores| {
                    let lexical = scores.get(&scored.chunk.id).copied().unwrap_or(0.0);
                    self.config.semantic_weight * scored.similarity
                        + self.config.lexical_weight * lexical
                });
                RetrievedChunk {
                    chunk: scored.chunk.clone(),
                    similarity: scored.similarity,
                    combined_score,
                }
            })
            .collect();
        fused.sort_by(|a, b| {
            b.relevance()
                .partial_cmp(&a.relevance())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        fused.truncate(self.config.max_chunks + self.config.overfetch);

        let mean_similarity =
            candidates.iter().map(|c| c.similarity).sum::<f32>() / candidates.len() as f32;

        let mut retained: Vec<RetrievedChunk> = fused
            .into_iter()
            .filter(|c| c.relevance() >= self.config.similarity_threshold)
            .collect();
        retained.truncate(self.config.max_chunks);

        if retained.is_empty() {
            // Distinguish "nothing matched" from "only weak matches" by how
            // the unfiltered candidate set scored on average.
            let kind = if mean_similarity < self.config.similarity_threshold / 2.0 {
                LowConfidenceKind::NoMatches
            } else {
                LowConfidenceKind::WeakMatches
            };
            return Ok(RetrievalOutcome::LowConfidence(kind));
        }

        Ok(RetrievalOutcome::Matches(retained))
    }

    /// Lexical scores keyed by chunk id, normalized so the lexical term is
    /// capped at 1.0. `None` means the lexical path did not run (empty query
    /// text) or degraded; callers fall back to pure cosine ordering.
    fn lexical_scores(&self, query_text: &str, limit: usize) -> Option<HashMap<Uuid, f32>> {
        if query_text.trim().is_empty() {
            return None;
        }

        let lexical = match self.lexical.lock() {
            Ok(guard) => guard,
            Err(e) => {
                log::warn!("Lexical index lock poisoned, falling back to vector-only: {e}");
                return None;
            }
        };

        match lexical.search(query_text, limit.max(20)) {
            Ok(matches) => Some(
                matches
                    .into_iter()
                    .map(|m| (m.chunk_id, (m.score * 10.0).min(1.0)))
                    .collect(),
            ),
            Err(e) => {
                log::warn!("Lexical search failed, falling back to vector-only: {e}");
                None
            }
        }
    }
}

mod models;
mod store;

pub use models::*;
pub use store::{cosine_similarity, ChunkFilter, ScoredChunk, Store, StoreError};

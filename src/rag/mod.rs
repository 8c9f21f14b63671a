//! Retrieval-augmented answering: chunking, embedding, ingestion,
//! hybrid retrieval, query reformulation, and usage metering.

pub mod assistant;
pub mod chunker;
pub mod embedder;
pub mod generator;
pub mod ingest;
pub mod reformulator;
pub mod retriever;
pub mod usage;

pub use assistant::{Assistant, AssistantError, ChatAnswer};
pub use embedder::{EmbeddingClient, EmbeddingError, HttpEmbeddingClient};
pub use generator::{Completion, GenerationClient, GenerationError, HttpGenerationClient};
pub use ingest::{IngestError, IngestionPipeline};
pub use retriever::{HybridRetriever, RetrievalError, RetrievalOutcome, RetrievedChunk};
pub use usage::{Allowance, UsageError, UsageMeter};

//! Study assistant server: document ingestion, hybrid retrieval, and
//! grounded conversational answering over a user's own materials.

pub mod auth;
pub mod config;
pub mod objects;
pub mod rag;
pub mod search;
pub mod server;
pub mod storage;

use std::sync::{Arc, Mutex};

use anyhow::Context;

use crate::auth::StaticTokenProvider;
use crate::config::AppConfig;
use crate::objects::ObjectStore;
use crate::rag::{
    Assistant, HttpEmbeddingClient, HttpGenerationClient, IngestionPipeline, UsageMeter,
};
use crate::search::LexicalIndex;
use crate::server::AppState;
use crate::storage::Store;

/// Wire up shared state from configuration. Creates the data directory
/// layout (database, lexical index, object store) if missing.
pub fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let data_dir = config.server.resolve_data_dir()?;
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {data_dir:?}"))?;

    let store = Arc::new(Mutex::new(
        Store::open(&data_dir.join("tandem.db")).context("opening database")?,
    ));
    let lexical = Arc::new(Mutex::new(
        LexicalIndex::new(data_dir.join("chunk_index")).context("opening lexical index")?,
    ));
    let signing_secret = config
        .server
        .url_signing_secret
        .clone()
        .unwrap_or_else(|| {
            log::warn!("No urlSigningSecret configured, signed URLs reset on restart");
            use rand::Rng;
            rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(32)
                .map(char::from)
                .collect()
        });
    let objects = Arc::new(
        ObjectStore::new(data_dir.join("objects"), signing_secret)
            .context("opening object store")?,
    );

    let embeddings: Arc<dyn rag::EmbeddingClient> =
        Arc::new(HttpEmbeddingClient::new(config.embedding.clone())?);
    let generator: Arc<dyn rag::GenerationClient> =
        Arc::new(HttpGenerationClient::new(config.generation.clone())?);

    let pipeline = IngestionPipeline::new(
        Arc::clone(&store),
        Arc::clone(&lexical),
        Arc::clone(&objects),
        Arc::clone(&embeddings),
        config.chunking.clone(),
    );
    let assistant = Arc::new(Assistant::new(
        Arc::clone(&store),
        Arc::clone(&lexical),
        Arc::clone(&embeddings),
        Arc::clone(&generator),
        UsageMeter::new(Arc::clone(&store), config.usage.clone()),
        config.retrieval.clone(),
        config.chat.clone(),
        config.generation.clone(),
    ));
    let usage = Arc::new(UsageMeter::new(Arc::clone(&store), config.usage.clone()));
    let auth = Arc::new(StaticTokenProvider::new(config.auth.tokens.clone()));

    if config.auth.tokens.is_empty() {
        log::warn!("No auth tokens configured, every request will be rejected");
    }

    Ok(AppState {
        store,
        objects,
        auth,
        pipeline,
        assistant,
        usage,
    })
}

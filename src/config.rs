//! Server configuration loaded from a TOML file.
//!
//! Every field carries a serde default so a missing or partial config file
//! still produces a usable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::TokenEntry;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Data directory not found")]
    DataDirNotFound,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AppConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub chunking: ChunkingConfig,
    pub retrieval: RetrievalConfig,
    pub chat: ChatConfig,
    pub usage: UsageConfig,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address for the HTTP server.
    pub bind: String,
    /// Data directory root. Defaults to the platform data dir + "tandem".
    pub data_dir: Option<PathBuf>,
    /// Secret used to sign expiring object URLs.
    pub url_signing_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7400".to_string(),
            data_dir: None,
            url_signing_secret: None,
        }
    }
}

impl ServerConfig {
    /// Resolve the data directory, falling back to the platform default.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        dirs::data_local_dir()
            .map(|p| p.join("tandem"))
            .ok_or(ConfigError::DataDirNotFound)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct AuthConfig {
    /// Static bearer tokens accepted by the server.
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChunkingConfig {
    /// Flush opportunistically once a passage reaches this many words.
    pub target_words: usize,
    /// Hard word budget per passage.
    pub max_words: usize,
    /// Trailing words carried into the next passage as a seed.
    pub overlap_words: usize,
    /// Remainders shorter than this are discarded.
    pub min_words: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_words: 400,
            max_words: 600,
            overlap_words: 60,
            min_words: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrievalConfig {
    /// Weight of the cosine-similarity term in the fused score.
    pub semantic_weight: f32,
    /// Weight of the normalized lexical term in the fused score.
    pub lexical_weight: f32,
    /// Minimum fused/similarity score a chunk must clear.
    pub similarity_threshold: f32,
    /// Maximum chunks handed to the generation model.
    pub max_chunks: usize,
    /// Extra candidates fetched beyond the limit before thresholding.
    pub overfetch: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            lexical_weight: 0.3,
            similarity_threshold: 0.3,
            max_chunks: 5,
            overfetch: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChatConfig {
    /// Maximum question length in characters.
    pub max_question_chars: usize,
    /// Prior conversation turns included in the generation prompt.
    pub history_turns: usize,
    /// Per-message character cap when history is included in prompts.
    pub history_message_chars: usize,
    /// Messages retained per conversation on save.
    pub max_stored_messages: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_question_chars: 2000,
            history_turns: 6,
            history_message_chars: 500,
            max_stored_messages: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UsageConfig {
    /// Queries allowed per user per reference-timezone day.
    pub daily_query_limit: i64,
    /// Optional global daily cost ceiling in USD, summed across users.
    pub daily_cost_limit: Option<f64>,
    /// Reference timezone as a UTC offset in hours (e.g. -5).
    pub timezone_offset_hours: i32,
    /// USD per million input tokens.
    pub cost_per_million_input: f64,
    /// USD per million output tokens.
    pub cost_per_million_output: f64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            daily_query_limit: 50,
            daily_cost_limit: None,
            timezone_offset_hours: -5,
            cost_per_million_input: 0.15,
            cost_per_million_output: 0.60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EmbeddingConfig {
    /// Base URL of an OpenAI-compatible embeddings endpoint.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// Expected output dimensionality.
    pub dimensions: usize,
    /// Texts per upstream request.
    pub batch_size: usize,
    /// API key, if the provider requires one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 20,
            api_key: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    pub base_url: String,
    /// Model identifier.
    pub model: String,
    /// API key, if the provider requires one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Token budget per answer.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f64,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            max_tokens: 1024,
            temperature: 0.3,
            timeout_secs: 60,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config file at {:?}, using defaults", path);
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

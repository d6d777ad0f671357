/// Configuration module for managing environment variables and API keys
///
/// This module loads and validates all configuration values from
/// environment variables (typically from a .env file). Validation happens
/// before anything touches the filesystem; the storage directories are
/// created by a separate call once the settings are known to be complete.
use std::collections::HashSet;
use std::env;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Settings without which the bot cannot start.
pub const REQUIRED_SETTINGS: [&str; 2] = ["TELEGRAM_BOT_TOKEN", "OPENAI_API_KEY"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<String>),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to create directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// What the engine does when the document index has nothing relevant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Run the web search straight away.
    Auto,
    /// Ask the user whether to search the web or answer from general knowledge.
    Offer,
}

impl FromStr for FallbackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(FallbackPolicy::Auto),
            "offer" => Ok(FallbackPolicy::Offer),
            other => Err(format!("expected `auto` or `offer`, got `{}`", other)),
        }
    }
}

/// Filesystem locations used by the bot.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    pub data_dir: PathBuf,
    /// Source files for ingestion
    pub documents_dir: PathBuf,
    /// Persistence directory of the local vector index
    pub vector_dir: PathBuf,
    /// One JSON file of conversation history per user
    pub memory_dir: PathBuf,
}

impl StoragePaths {
    pub fn all(&self) -> [&Path; 4] {
        [
            &self.data_dir,
            &self.documents_dir,
            &self.vector_dir,
            &self.memory_dir,
        ]
    }

    /// Create every directory that does not exist yet
    pub fn create_all(&self) -> Result<(), ConfigError> {
        for dir in self.all() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Directory {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token from BotFather
    pub telegram_token: String,

    /// OpenAI API key (chat, vision, embeddings, speech)
    pub openai_api_key: String,

    /// Base URL of the OpenAI-compatible API
    pub openai_base_url: String,

    /// Tavily API key; web search is disabled without it
    pub tavily_api_key: Option<String>,

    /// Telegram user ids allowed to run administrative commands
    pub admin_user_ids: HashSet<u64>,

    /// Chat model (e.g., "gpt-4o-mini")
    pub llm_model: String,

    /// Vision-capable model used for image messages
    pub vision_model: String,

    pub llm_temperature: f32,
    pub llm_max_tokens: u32,

    /// Embedding model (e.g., "text-embedding-3-small")
    pub embedding_model: String,
    pub embedding_dimensions: usize,

    /// Chunk size and overlap, in characters
    pub chunk_size: usize,
    pub chunk_overlap: usize,

    /// Number of document chunks to retrieve for context
    pub top_k: usize,

    /// Similarity floor below which retrieved chunks are ignored
    pub min_relevance: f32,

    pub fallback_policy: FallbackPolicy,
    pub web_max_results: usize,

    /// History size (in tokens) that triggers summarization
    pub memory_token_limit: usize,

    /// Most recent turns kept verbatim when history is summarized
    pub memory_keep_recent: usize,

    /// Language the bot answers in
    pub response_language: String,

    /// Answer voice notes with a synthesized voice note as well
    pub voice_replies: bool,
    pub tts_model: String,
    pub tts_voice: String,
    pub transcription_model: String,

    /// PostgreSQL URL; when set, chunks are stored with pgvector instead of
    /// the local index
    pub database_url: Option<String>,

    /// Table name for storing chunk embeddings in PostgreSQL
    pub embeddings_table: String,

    pub paths: StoragePaths,

    /// Ingest the documents directory at startup when the index is empty
    pub auto_ingest: bool,

    pub http_timeout: Duration,
    pub http_max_retries: u32,

    /// Port of the health/stats HTTP server (disabled when unset)
    pub health_port: Option<u16>,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// # Errors
    /// Returns an error listing every missing required variable, or naming
    /// the first variable with an unparsable value
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    ///
    /// Blank values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let missing: Vec<String> = REQUIRED_SETTINGS
            .into_iter()
            .filter(|key| get(*key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let home = PathBuf::from(get("BOT_HOME").unwrap_or_else(|| ".".to_string()));
        let dir = |key: &str, default: &str| {
            get(key)
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join(default))
        };

        let chunk_size: usize = parse_or(&get, "CHUNK_SIZE", 800)?;
        let chunk_overlap: usize = parse_or(&get, "CHUNK_OVERLAP", 100)?;
        if chunk_size == 0 {
            return Err(invalid("CHUNK_SIZE", "0", "must be greater than zero"));
        }
        if chunk_overlap >= chunk_size {
            return Err(invalid(
                "CHUNK_OVERLAP",
                &chunk_overlap.to_string(),
                "must be smaller than CHUNK_SIZE",
            ));
        }

        let llm_temperature: f32 = parse_or(&get, "LLM_TEMPERATURE", 0.7)?;
        if !(0.0..=2.0).contains(&llm_temperature) {
            return Err(invalid(
                "LLM_TEMPERATURE",
                &llm_temperature.to_string(),
                "must be between 0 and 2",
            ));
        }

        Ok(Config {
            telegram_token: get("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
            openai_api_key: get("OPENAI_API_KEY").unwrap_or_default(),
            openai_base_url: get("OPENAI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            tavily_api_key: get("TAVILY_API_KEY"),
            admin_user_ids: parse_admin_ids(get("ADMIN_USER_IDS").as_deref().unwrap_or(""))?,

            llm_model: get("LLM_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            vision_model: get("VISION_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
            llm_temperature,
            llm_max_tokens: parse_or(&get, "LLM_MAX_TOKENS", 1000)?,

            embedding_model: get("EMBEDDING_MODEL")
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            embedding_dimensions: parse_or(&get, "EMBEDDING_DIMENSIONS", 1536)?,

            chunk_size,
            chunk_overlap,
            top_k: parse_or(&get, "RAG_TOP_K", 8)?,
            min_relevance: parse_or(&get, "RAG_MIN_SCORE", 0.3)?,

            fallback_policy: parse_or(&get, "WEB_FALLBACK", FallbackPolicy::Auto)?,
            web_max_results: parse_or(&get, "WEB_MAX_RESULTS", 5)?,

            memory_token_limit: parse_or(&get, "MEMORY_TOKEN_LIMIT", 2000)?,
            memory_keep_recent: parse_or(&get, "MEMORY_KEEP_RECENT", 4)?,

            response_language: get("RESPONSE_LANGUAGE").unwrap_or_else(|| "English".to_string()),

            voice_replies: parse_or(&get, "VOICE_REPLIES", false)?,
            tts_model: get("TTS_MODEL").unwrap_or_else(|| "tts-1".to_string()),
            tts_voice: get("TTS_VOICE").unwrap_or_else(|| "alloy".to_string()),
            transcription_model: get("TRANSCRIPTION_MODEL")
                .unwrap_or_else(|| "whisper-1".to_string()),

            database_url: get("DATABASE_URL"),
            embeddings_table: get("EMBEDDINGS_TABLE").unwrap_or_else(|| "film_chunks".to_string()),

            paths: StoragePaths {
                data_dir: dir("DATA_DIR", "data"),
                documents_dir: dir("DOCUMENTS_DIR", "documents"),
                vector_dir: dir("VECTOR_DIR", "vector_db"),
                memory_dir: dir("MEMORY_DIR", "user_memories"),
            },

            auto_ingest: parse_or(&get, "AUTO_INGEST", true)?,

            http_timeout: Duration::from_secs(parse_or(&get, "HTTP_TIMEOUT_SECS", 60)?),
            http_max_retries: parse_or(&get, "HTTP_MAX_RETRIES", 3)?,

            health_port: get("HEALTH_PORT")
                .map(|v| {
                    v.trim()
                        .parse()
                        .map_err(|e: std::num::ParseIntError| invalid("HEALTH_PORT", &v, e))
                })
                .transpose()?,
        })
    }

    /// Create the data, documents, vector-index and memory directories
    pub fn prepare_directories(&self) -> Result<(), ConfigError> {
        self.paths.create_all()?;
        if self.admin_user_ids.is_empty() {
            log::warn!("No administrators configured (ADMIN_USER_IDS is empty)");
        }
        Ok(())
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        self.admin_user_ids.contains(&user_id)
    }

    pub fn web_search_enabled(&self) -> bool {
        self.tavily_api_key.is_some()
    }
}

/// Parse a comma-separated list of Telegram user ids
pub fn parse_admin_ids(raw: &str) -> Result<HashSet<u64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u64>()
                .map_err(|e| invalid("ADMIN_USER_IDS", part, e))
        })
        .collect()
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.trim().parse().map_err(|e| invalid(key, &raw, e)),
        None => Ok(default),
    }
}

fn invalid(key: &str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Error types shared by the bot's library layers
///
/// The application boundary (bot wiring, main, HTTP server) uses `anyhow`;
/// everything below it returns `BotError` so callers can decide per variant
/// whether a failure is fatal, skippable or user-visible.
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum BotError {
    /// Missing or invalid settings. Fatal at startup.
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// The document format is not one of PDF, DOCX or TXT.
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),

    /// Text could not be extracted from a document.
    #[error("failed to extract text from {path}: {message}")]
    Extraction { path: String, message: String },

    /// The embedding service rejected or failed a batch.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The vector index could not be queried.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// A hosted API (language model, search tool, speech) failed.
    #[error("{service} request failed: {message}")]
    ExternalService {
        service: &'static str,
        message: String,
    },

    /// A prompt was built with a blank required field.
    #[error("prompt `{template}` requires a non-empty `{field}`")]
    InvalidPrompt {
        template: &'static str,
        field: &'static str,
    },
}

impl BotError {
    pub fn external(service: &'static str, message: impl Into<String>) -> Self {
        BotError::ExternalService {
            service,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BotError>;

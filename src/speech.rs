/// Voice input and output
use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Speech: Send + Sync {
    /// Transcribe an audio file (Telegram voice notes are OGG/Opus)
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String>;

    /// Synthesize `text` into an OGG/Opus voice note
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

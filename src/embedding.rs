/// Embedding boundary
use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model identifier, e.g. `text-embedding-3-small`
    fn model_name(&self) -> &str;

    /// Embed a batch of texts, one vector per input in input order.
    ///
    /// Either every text is embedded or the call fails with
    /// `BotError::Embedding`.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

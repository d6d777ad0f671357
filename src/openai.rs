/// OpenAI API client
///
/// A single client covers every OpenAI endpoint the bot talks to:
/// - chat completions (text and vision)
/// - embeddings
/// - Whisper transcription and text-to-speech
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::client::{send_with_retry, RetryPolicy};
use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{BotError, Result};
use crate::llm::{ChatMessage, GenerationOptions, LanguageModel};
use crate::speech::Speech;

/// Maximum inputs per embeddings request
const EMBEDDING_BATCH_SIZE: usize = 64;

/// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest<'a> {
    model: &'a str,
    messages: Vec<serde_json::Value>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChatChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatChoice {
    message: OpenAIChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAISpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct OpenAITranscriptionResponse {
    text: String,
}

pub struct OpenAIClient {
    http_client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
    embedding_model: String,
    embedding_dimensions: usize,
    transcription_model: String,
    tts_model: String,
    tts_voice: String,
}

impl OpenAIClient {
    pub fn new(config: &Config, http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            api_key: config.openai_api_key.clone(),
            base_url: config.openai_base_url.clone(),
            retry: RetryPolicy::from_config(config),
            embedding_model: config.embedding_model.clone(),
            embedding_dimensions: config.embedding_dimensions,
            transcription_model: config.transcription_model.clone(),
            tts_model: config.tts_model.clone(),
            tts_voice: config.tts_voice.clone(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http_client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        // The `dimensions` parameter is only understood by the text-embedding-3 family
        let dimensions = self
            .embedding_model
            .starts_with("text-embedding-3")
            .then_some(self.embedding_dimensions);
        let request = OpenAIEmbeddingRequest {
            input: batch,
            model: &self.embedding_model,
            dimensions,
        };

        let response = send_with_retry("OpenAI embeddings", self.retry, || {
            self.post("embeddings").json(&request)
        })
        .await
        .map_err(|e| BotError::Embedding(e.to_string()))?;

        let response: OpenAIEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| BotError::Embedding(format!("failed to parse response: {}", e)))?;

        if response.data.len() != batch.len() {
            return Err(BotError::Embedding(format!(
                "expected {} embeddings, got {}",
                batch.len(),
                response.data.len()
            )));
        }

        let mut data = response.data;
        data.sort_by_key(|d| d.index);
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

/// Convert a chat message into the OpenAI wire format
///
/// Messages with an image use the content-parts form with a base64 data URL.
fn message_to_json(message: &ChatMessage) -> serde_json::Value {
    match &message.image {
        None => serde_json::json!({
            "role": message.role,
            "content": message.content,
        }),
        Some(image) => serde_json::json!({
            "role": message.role,
            "content": [
                { "type": "text", "text": message.content },
                {
                    "type": "image_url",
                    "image_url": {
                        "url": format!(
                            "data:{};base64,{}",
                            image.mime_type,
                            STANDARD.encode(&image.bytes)
                        ),
                    },
                },
            ],
        }),
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String> {
        log::info!("Generating response using {}", options.model);

        let request = OpenAIChatRequest {
            model: &options.model,
            messages: messages.iter().map(message_to_json).collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let response = send_with_retry("OpenAI chat", self.retry, || {
            self.post("chat/completions").json(&request)
        })
        .await?;

        let response: OpenAIChatResponse = response.json().await.map_err(|e| {
            BotError::external("OpenAI chat", format!("failed to parse response: {}", e))
        })?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| BotError::external("OpenAI chat", "no response content"))
    }
}

#[async_trait]
impl Embedder for OpenAIClient {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBEDDING_BATCH_SIZE) {
            embeddings.extend(self.embed_batch(batch).await?);
        }
        Ok(embeddings)
    }
}

#[async_trait]
impl Speech for OpenAIClient {
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String> {
        let response = send_with_retry("OpenAI transcription", self.retry, || {
            let file = reqwest::multipart::Part::bytes(audio.clone())
                .file_name(file_name.to_string());
            let form = reqwest::multipart::Form::new()
                .text("model", self.transcription_model.clone())
                .text("response_format", "json")
                .part("file", file);
            self.post("audio/transcriptions").multipart(form)
        })
        .await?;

        let response: OpenAITranscriptionResponse = response.json().await.map_err(|e| {
            BotError::external("OpenAI transcription", format!("failed to parse response: {}", e))
        })?;

        Ok(response.text.trim().to_string())
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let request = OpenAISpeechRequest {
            model: &self.tts_model,
            input: text,
            voice: &self.tts_voice,
            response_format: "opus",
        };

        let response = send_with_retry("OpenAI speech", self.retry, || {
            self.post("audio/speech").json(&request)
        })
        .await?;

        let audio = response
            .bytes()
            .await
            .map_err(|e| BotError::external("OpenAI speech", e.to_string()))?;
        Ok(audio.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ImageAttachment;

    #[test]
    fn test_text_message_json() {
        let json = message_to_json(&ChatMessage::user("Who directed Heat?"));
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "Who directed Heat?");
    }

    #[test]
    fn test_image_message_uses_content_parts() {
        let message = ChatMessage::user("What film is this?").with_image(ImageAttachment {
            bytes: vec![0xff, 0xd8, 0xff],
            mime_type: "image/jpeg".to_string(),
        });
        let json = message_to_json(&message);
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][0]["text"], "What film is this?");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/jpeg;base64,/9j/"
        );
    }

    #[test]
    fn test_system_role_serializes_lowercase() {
        let json = message_to_json(&ChatMessage::system("persona"));
        assert_eq!(json["role"], "system");
    }
}

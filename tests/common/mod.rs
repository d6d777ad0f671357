#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use film_series_bot::config::Config;
use film_series_bot::conversation::{ConversationManager, HistoryBudget};
use film_series_bot::documents::DocumentProcessor;
use film_series_bot::embedding::Embedder;
use film_series_bot::engine::{ConversationEngine, EngineSettings};
use film_series_bot::error::{BotError, Result};
use film_series_bot::handlers::MessageProcessor;
use film_series_bot::llm::{ChatMessage, GenerationOptions, LanguageModel};
use film_series_bot::speech::Speech;
use film_series_bot::vector_store::{LocalVectorIndex, VectorStoreManager};
use film_series_bot::web_search::{WebResult, WebSearch};

pub const ADMIN_ID: u64 = 1;
pub const USER_ID: u64 = 42;

const VOCABULARY: &[&str] = &[
    "oppenheimer", "nolan", "director", "heat", "mann", "thriller", "dune", "villeneuve",
    "desert", "scifi", "comedy", "paris", "netflix", "series",
];

/// Bag-of-words embedder over a fixed vocabulary
pub struct FakeEmbedder {
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    fn embed_one(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let words: Vec<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();
        VOCABULARY
            .iter()
            .map(|term| words.iter().filter(|w| *w == term).count() as f32)
            .collect()
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-embedding"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BotError::Embedding("service unavailable".to_string()));
        }
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

/// Language model that replays queued replies and records every call
pub struct ScriptedModel {
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    calls: Mutex<Vec<(Vec<ChatMessage>, GenerationOptions)>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn reply(&self, text: &str) {
        self.replies.lock().unwrap().push_back(Ok(text.to_string()));
    }

    pub fn fail(&self, message: &str) {
        self.replies.lock().unwrap().push_back(Err(message.to_string()));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(Vec<ChatMessage>, GenerationOptions)> {
        self.calls.lock().unwrap().clone()
    }

    /// Content of the final message of the most recent call
    pub fn last_prompt(&self) -> String {
        self.calls
            .lock()
            .unwrap()
            .last()
            .and_then(|(messages, _)| messages.last())
            .map(|m| m.content.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &GenerationOptions,
    ) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), options.clone()));
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(message)) => Err(BotError::external("openai", message)),
            None => Ok("(unscripted reply)".to_string()),
        }
    }
}

/// Web search returning a fixed result set
pub struct FakeSearch {
    pub results: Vec<WebResult>,
    pub fail: bool,
    pub queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn with_results(results: Vec<WebResult>) -> Self {
        Self {
            results,
            fail: false,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_results(Vec::new())
        }
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebSearch for FakeSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebResult>> {
        self.queries.lock().unwrap().push(query.to_string());
        if self.fail {
            return Err(BotError::external("tavily", "HTTP 503"));
        }
        Ok(self.results.iter().take(max_results).cloned().collect())
    }
}

pub struct FakeSpeech {
    pub transcript: String,
    pub fail_synthesis: bool,
}

#[async_trait]
impl Speech for FakeSpeech {
    async fn transcribe(&self, _audio: Vec<u8>, _file_name: &str) -> Result<String> {
        Ok(self.transcript.clone())
    }

    async fn synthesize(&self, _text: &str) -> Result<Vec<u8>> {
        if self.fail_synthesis {
            return Err(BotError::external("openai", "HTTP 500"));
        }
        Ok(b"OggS-fake-voice".to_vec())
    }
}

pub fn web_result(title: &str, url: &str) -> WebResult {
    WebResult {
        title: title.to_string(),
        snippet: format!("{} is streaming now.", title),
        url: url.to_string(),
    }
}

pub fn test_config(home: &Path, overrides: &[(&str, &str)]) -> Config {
    let mut vars: HashMap<String, String> = [
        ("TELEGRAM_BOT_TOKEN", "123:token"),
        ("OPENAI_API_KEY", "sk-test"),
        ("ADMIN_USER_IDS", "1"),
        ("RAG_MIN_SCORE", "0.5"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert("BOT_HOME".to_string(), home.display().to_string());
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let config = Config::from_lookup(|key| vars.get(key).cloned()).expect("valid test config");
    config.prepare_directories().expect("directories created");
    config
}

/// Everything needed to drive the engine against fakes
pub struct Harness {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub llm: Arc<ScriptedModel>,
    pub embedder: Arc<FakeEmbedder>,
    pub search: Option<Arc<FakeSearch>>,
    pub store: Arc<VectorStoreManager>,
    pub documents: Arc<DocumentProcessor>,
    pub engine: Arc<ConversationEngine>,
}

impl Harness {
    pub async fn new(overrides: &[(&str, &str)], search: Option<FakeSearch>) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(dir.path(), overrides);

        let llm = Arc::new(ScriptedModel::new());
        let embedder = Arc::new(FakeEmbedder::new());
        let index = LocalVectorIndex::open(&config.paths.vector_dir)
            .await
            .expect("local index");
        let store = Arc::new(VectorStoreManager::new(
            embedder.clone(),
            Arc::new(index),
            config.min_relevance,
        ));
        let documents = Arc::new(DocumentProcessor::new(
            store.clone(),
            config.paths.documents_dir.clone(),
            config.chunk_size,
            config.chunk_overlap,
        ));

        let search = search.map(Arc::new);
        let engine = Arc::new(ConversationEngine::new(
            llm.clone(),
            store.clone(),
            search.clone().map(|s| s as Arc<dyn WebSearch>),
            HistoryBudget::new(config.memory_token_limit, config.memory_keep_recent)
                .expect("tokenizer"),
            EngineSettings::from_config(&config),
        ));

        Self {
            dir,
            config: Arc::new(config),
            llm,
            embedder,
            search,
            store,
            documents,
            engine,
        }
    }

    /// Write a catalog file into the documents directory
    pub fn add_document(&self, name: &str, content: &str) {
        std::fs::write(self.config.paths.documents_dir.join(name), content)
            .expect("write document");
    }

    pub fn conversations(&self) -> Arc<ConversationManager> {
        Arc::new(ConversationManager::new(self.config.paths.memory_dir.clone()))
    }

    pub fn processor(&self, speech: FakeSpeech) -> (MessageProcessor, Arc<ConversationManager>) {
        let conversations = self.conversations();
        let processor = MessageProcessor::new(
            self.config.clone(),
            self.engine.clone(),
            conversations.clone(),
            self.documents.clone(),
            self.store.clone(),
            Arc::new(speech),
        );
        (processor, conversations)
    }
}

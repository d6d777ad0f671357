/// Conversation engine
///
/// For every text query the engine:
/// 1. summarizes the session history when it is over budget
/// 2. rewrites the query into a standalone question using the history
/// 3. retrieves matching catalog chunks
/// 4. falls back to web search or general knowledge when nothing matches
/// 5. asks the language model for the answer and records the exchange
///
/// Images take a separate vision branch that shares the same history.
/// Language-model failures end the turn with an error; the caller decides
/// what the user sees.
use std::sync::Arc;

use crate::config::{Config, FallbackPolicy};
use crate::conversation::{format_transcript, ConversationTurn, HistoryBudget, UserSession};
use crate::error::Result;
use crate::llm::{ChatMessage, GenerationOptions, ImageAttachment, LanguageModel};
use crate::prompts::{
    format_context, format_web_results, system_prompt, ContextualizePrompt, KnowledgePrompt,
    RagQueryPrompt, SummarizePrompt, VisionAnalysisPrompt, VisionQuestionPrompt, WebSearchPrompt,
    NO_CONTEXT_NOTICE, NO_INFORMATION_NOTICE,
};
use crate::vector_store::{ScoredChunk, VectorStoreManager};
use crate::web_search::WebSearch;

/// Reply when a fallback button is pressed but no query is waiting
pub const EXPIRED_FOLLOW_UP_NOTICE: &str =
    "That request is no longer pending. Please send your question again.";

/// What an answer was grounded on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerSource {
    Documents,
    Web,
    Knowledge,
    Vision,
    /// Nothing in the catalogs; the user was asked how to continue
    NoContext,
    /// Nothing in the catalogs nor on the web
    NoInformation,
    /// A follow-up arrived with no pending query
    Expired,
}

/// Ways to continue offered after a fallback notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    WebSearch,
    Knowledge,
}

impl FollowUp {
    pub fn callback_data(&self) -> &'static str {
        match self {
            FollowUp::WebSearch => "fallback:web",
            FollowUp::Knowledge => "fallback:knowledge",
        }
    }

    pub fn from_callback_data(data: &str) -> Option<Self> {
        match data {
            "fallback:web" => Some(FollowUp::WebSearch),
            "fallback:knowledge" => Some(FollowUp::Knowledge),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FollowUp::WebSearch => "🌐 Search the web",
            FollowUp::Knowledge => "🎬 Answer from knowledge",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineReply {
    pub text: String,
    pub source: AnswerSource,
    pub standalone_query: String,
    pub offers: Vec<FollowUp>,
}

impl EngineReply {
    fn answer(text: String, source: AnswerSource, standalone_query: String) -> Self {
        Self {
            text,
            source,
            standalone_query,
            offers: Vec::new(),
        }
    }
}

/// Tunables the engine reads from the configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub top_k: usize,
    pub fallback_policy: FallbackPolicy,
    pub web_max_results: usize,
    pub answer: GenerationOptions,
    pub vision: GenerationOptions,
    /// Deterministic options for rewriting and summarizing
    pub utility: GenerationOptions,
    pub response_language: String,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            top_k: config.top_k,
            fallback_policy: config.fallback_policy,
            web_max_results: config.web_max_results,
            answer: GenerationOptions {
                model: config.llm_model.clone(),
                temperature: config.llm_temperature,
                max_tokens: config.llm_max_tokens,
            },
            vision: GenerationOptions {
                model: config.vision_model.clone(),
                temperature: config.llm_temperature,
                max_tokens: config.llm_max_tokens,
            },
            utility: GenerationOptions {
                model: config.llm_model.clone(),
                temperature: 0.0,
                max_tokens: 500,
            },
            response_language: config.response_language.clone(),
        }
    }
}

pub struct ConversationEngine {
    llm: Arc<dyn LanguageModel>,
    vector_store: Arc<VectorStoreManager>,
    web_search: Option<Arc<dyn WebSearch>>,
    budget: HistoryBudget,
    settings: EngineSettings,
    system_prompt: String,
}

impl ConversationEngine {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        vector_store: Arc<VectorStoreManager>,
        web_search: Option<Arc<dyn WebSearch>>,
        budget: HistoryBudget,
        settings: EngineSettings,
    ) -> Self {
        let system_prompt = system_prompt(&settings.response_language);
        Self {
            llm,
            vector_store,
            web_search,
            budget,
            settings,
            system_prompt,
        }
    }

    pub fn web_search_enabled(&self) -> bool {
        self.web_search.is_some()
    }

    /// Answer a text query and record the exchange in `session`
    pub async fn respond(&self, session: &mut UserSession, query: &str) -> Result<EngineReply> {
        self.summarize_if_needed(session).await?;

        let standalone = self.contextualize(query, &session.turns).await?;
        session.pending_query = None;

        let chunks = self.retrieve(&standalone).await;
        let reply = if chunks.is_empty() {
            self.fallback(session, standalone).await?
        } else {
            let prompt = RagQueryPrompt::new(&format_context(&chunks), &standalone)?;
            let text = self.generate(session, prompt.render()).await?;
            EngineReply::answer(text, AnswerSource::Documents, standalone)
        };

        session.push_exchange(query, reply.text.clone());
        Ok(reply)
    }

    /// Continue a pending query with the strategy the user picked
    pub async fn follow_up(
        &self,
        session: &mut UserSession,
        choice: FollowUp,
    ) -> Result<EngineReply> {
        let Some(query) = session.pending_query.take() else {
            return Ok(EngineReply::answer(
                EXPIRED_FOLLOW_UP_NOTICE.to_string(),
                AnswerSource::Expired,
                String::new(),
            ));
        };
        log::info!("Follow-up {:?} for pending query: {}", choice, query);

        let reply = match choice {
            FollowUp::WebSearch => self.search_web(session, query.clone()).await?,
            FollowUp::Knowledge => self.answer_from_knowledge(session, query.clone()).await?,
        };

        session.push_exchange(format!("{} ({})", query, choice.label()), reply.text.clone());
        Ok(reply)
    }

    /// Describe or answer a question about an image
    pub async fn analyze_image(
        &self,
        session: &mut UserSession,
        caption: &str,
        image: ImageAttachment,
    ) -> Result<EngineReply> {
        let caption = caption.trim();
        let prompt = if caption.ends_with('?') {
            VisionQuestionPrompt::new(caption)?.render()
        } else {
            VisionAnalysisPrompt::new(caption).render()
        };

        self.summarize_if_needed(session).await?;

        let mut messages = self.base_messages(session);
        messages.push(ChatMessage::user(prompt).with_image(image));
        let text = self.llm.complete(&messages, &self.settings.vision).await?;

        let user_turn = if caption.is_empty() {
            "[image]".to_string()
        } else {
            format!("[image] {}", caption)
        };
        session.pending_query = None;
        session.push_exchange(user_turn, text.clone());
        Ok(EngineReply::answer(
            text,
            AnswerSource::Vision,
            caption.to_string(),
        ))
    }

    /// Collapse older turns into one summary turn when history is over budget
    ///
    /// Returns whether a summary was made.
    pub async fn summarize_if_needed(&self, session: &mut UserSession) -> Result<bool> {
        let Some(count) = self.budget.turns_to_summarize(session) else {
            return Ok(false);
        };

        let prompt = SummarizePrompt::new(&format_transcript(&session.turns[..count]))?;
        let summary = self
            .llm
            .complete(&[ChatMessage::user(prompt.render())], &self.settings.utility)
            .await?;

        session.summarize_prefix(count, summary.trim());
        log::info!(
            "Summarized {} turns for user {} ({} remain)",
            count,
            session.user_id,
            session.turns.len()
        );
        Ok(true)
    }

    /// Rewrite `query` so it can be understood without the history
    ///
    /// Without history, or when the model returns nothing, the query is used as is.
    pub async fn contextualize(&self, query: &str, history: &[ConversationTurn]) -> Result<String> {
        let query = query.trim();
        if history.is_empty() {
            return Ok(query.to_string());
        }

        let prompt = ContextualizePrompt::new(&format_transcript(history), query)?;
        let rewritten = self
            .llm
            .complete(&[ChatMessage::user(prompt.render())], &self.settings.utility)
            .await?;

        let rewritten = rewritten.trim().trim_matches('"').trim();
        if rewritten.is_empty() {
            return Ok(query.to_string());
        }
        if rewritten != query {
            log::info!("Standalone query: {}", rewritten);
        }
        Ok(rewritten.to_string())
    }

    /// Retrieval errors count as "nothing found"
    async fn retrieve(&self, standalone: &str) -> Vec<ScoredChunk> {
        match self.vector_store.query(standalone, self.settings.top_k).await {
            Ok(chunks) => chunks,
            Err(e) => {
                log::warn!("Retrieval failed, falling back: {}", e);
                Vec::new()
            }
        }
    }

    async fn fallback(&self, session: &mut UserSession, standalone: String) -> Result<EngineReply> {
        match self.settings.fallback_policy {
            FallbackPolicy::Offer => {
                log::info!("No relevant chunks found, offering fallbacks");
                let mut offers = Vec::new();
                if self.web_search_enabled() {
                    offers.push(FollowUp::WebSearch);
                }
                offers.push(FollowUp::Knowledge);
                session.pending_query = Some(standalone.clone());
                Ok(EngineReply {
                    text: NO_CONTEXT_NOTICE.to_string(),
                    source: AnswerSource::NoContext,
                    standalone_query: standalone,
                    offers,
                })
            }
            FallbackPolicy::Auto => {
                log::info!("No relevant chunks found, trying web search");
                self.search_web(session, standalone).await
            }
        }
    }

    /// Web-grounded answer, or the next best thing
    ///
    /// No search tool or a failing one leads to a general-knowledge answer;
    /// an empty result set leads to the no-information notice.
    async fn search_web(
        &self,
        session: &mut UserSession,
        standalone: String,
    ) -> Result<EngineReply> {
        let Some(web_search) = &self.web_search else {
            log::info!("Web search not configured, answering from knowledge");
            return self.answer_from_knowledge(session, standalone).await;
        };

        match web_search
            .search(&standalone, self.settings.web_max_results)
            .await
        {
            Ok(results) if !results.is_empty() => {
                let prompt = WebSearchPrompt::new(&format_web_results(&results), &standalone)?;
                let text = self.generate(session, prompt.render()).await?;
                Ok(EngineReply::answer(text, AnswerSource::Web, standalone))
            }
            Ok(_) => {
                log::info!("Web search returned nothing for: {}", standalone);
                session.pending_query = Some(standalone.clone());
                Ok(EngineReply {
                    text: NO_INFORMATION_NOTICE.to_string(),
                    source: AnswerSource::NoInformation,
                    standalone_query: standalone,
                    offers: vec![FollowUp::Knowledge],
                })
            }
            Err(e) => {
                log::warn!("Web search failed, answering from knowledge: {}", e);
                self.answer_from_knowledge(session, standalone).await
            }
        }
    }

    async fn answer_from_knowledge(
        &self,
        session: &UserSession,
        standalone: String,
    ) -> Result<EngineReply> {
        let prompt = KnowledgePrompt::new(&standalone)?;
        let text = self.generate(session, prompt.render()).await?;
        Ok(EngineReply::answer(text, AnswerSource::Knowledge, standalone))
    }

    /// System prompt followed by the session history
    fn base_messages(&self, session: &UserSession) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(self.system_prompt.clone())];
        messages.extend(session.to_messages());
        messages
    }

    async fn generate(&self, session: &UserSession, prompt: String) -> Result<String> {
        let mut messages = self.base_messages(session);
        messages.push(ChatMessage::user(prompt));
        self.llm.complete(&messages, &self.settings.answer).await
    }
}

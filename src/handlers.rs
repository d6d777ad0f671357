/// Message handlers module
///
/// This module handles:
/// - Normalizing Telegram messages (text, photo, voice, document) into a `UserQuery`
/// - Determining when the bot should respond in group chats
/// - Running one conversation turn per user under that user's session lock
/// - Access control for administrative commands
/// - Formatting replies as Telegram HTML, with a plain-text fallback
use std::sync::Arc;

use anyhow::Result;
use teloxide::{
    net::Download,
    prelude::*,
    types::{ChatAction, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Me, ParseMode},
};
use walkdir::WalkDir;

use crate::config::Config;
use crate::conversation::ConversationManager;
use crate::documents::{DocumentProcessor, IngestReport};
use crate::engine::{ConversationEngine, EngineReply, FollowUp};
use crate::error::BotError;
use crate::llm::ImageAttachment;
use crate::markup::{split_message, strip_tags, to_plain_text, to_telegram_html, MAX_MESSAGE_CHARS};
use crate::speech::Speech;
use crate::vector_store::VectorStoreManager;

pub const APOLOGY_MESSAGE: &str =
    "😔 Sorry, I ran into a problem while answering. Please try again in a moment.";
pub const NOT_AUTHORIZED_MESSAGE: &str = "⛔ This command is reserved for administrators.";
pub const TRANSCRIPTION_FAILED_MESSAGE: &str =
    "🎙️ Sorry, I couldn't understand that voice message. Could you type your question?";

const WELCOME_MESSAGE: &str = "🎬 Hi! I'm **Film&Series Bot**, your film and TV critic.\n\n\
Ask me for recommendations, details about a film or series, or the latest streaming news.\n\n\
How to use me:\n\
• Send a question as text or as a voice message\n\
• Send a poster or a screenshot, with a caption if you have a question about it\n\
• In group chats, mention me so I know you're talking to me\n\n\
I never make up release dates, links or original titles: if I don't know, I'll tell you. 🍿";

const HELP_MESSAGE: &str = "ℹ️ **Film&Series Bot help**\n\n\
Commands:\n\
/start - Welcome message\n\
/help - Show this help\n\
/clear - Forget our conversation\n\n\
How I work:\n\
• I first look through the film catalogs uploaded by the administrators\n\
• If they have nothing, I search the web or answer from general knowledge\n\
• I remember our conversation, so you can ask follow-up questions\n\
• Images are analysed with a vision model";

const ADMIN_HELP: &str = "\n\nAdministrator commands:\n\
/ingest - Re-index every file in the documents folder\n\
/stats - Knowledge base statistics\n\
Send a PDF, DOCX or TXT file to add it to the catalogs.";

/// A user message in the shape the engine works with
#[derive(Debug, Clone)]
pub struct UserQuery {
    pub text: String,
    pub image: Option<ImageAttachment>,
    /// The text was transcribed from a voice message
    pub from_voice: bool,
}

impl UserQuery {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
            from_voice: false,
        }
    }
}

/// A formatted reply ready to be sent
#[derive(Debug, Clone, Default)]
pub struct BotReply {
    /// HTML messages, each within Telegram's size limit
    pub parts: Vec<String>,
    pub offers: Vec<FollowUp>,
    /// OGG/Opus voice note to send after the text
    pub voice: Option<Vec<u8>>,
}

impl BotReply {
    pub fn plain(text: &str) -> Self {
        Self {
            parts: split_message(text, MAX_MESSAGE_CHARS)
                .iter()
                .map(|part| to_telegram_html(part))
                .collect(),
            ..Default::default()
        }
    }

    fn from_engine(reply: EngineReply, voice: Option<Vec<u8>>) -> Self {
        Self {
            offers: reply.offers,
            voice,
            ..Self::plain(&reply.text)
        }
    }
}

enum TurnInput {
    Text(String),
    Image { caption: String, image: ImageAttachment },
    FollowUp(FollowUp),
}

/// Ties the engine, the per-user sessions and the admin tooling together
pub struct MessageProcessor {
    config: Arc<Config>,
    engine: Arc<ConversationEngine>,
    conversations: Arc<ConversationManager>,
    documents: Arc<DocumentProcessor>,
    vector_store: Arc<VectorStoreManager>,
    speech: Arc<dyn Speech>,
}

impl MessageProcessor {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<ConversationEngine>,
        conversations: Arc<ConversationManager>,
        documents: Arc<DocumentProcessor>,
        vector_store: Arc<VectorStoreManager>,
        speech: Arc<dyn Speech>,
    ) -> Self {
        Self {
            config,
            engine,
            conversations,
            documents,
            vector_store,
            speech,
        }
    }

    pub fn is_admin(&self, user_id: u64) -> bool {
        self.config.is_admin(user_id)
    }

    /// Answer a normalized query
    ///
    /// Errors become an apology; the stored history is only updated when the
    /// turn succeeds.
    pub async fn process(&self, user_id: u64, query: UserQuery) -> BotReply {
        let input = match query.image {
            Some(image) => TurnInput::Image {
                caption: query.text,
                image,
            },
            None => TurnInput::Text(query.text),
        };

        match self.run_turn(user_id, input).await {
            Ok(reply) => {
                let voice = if query.from_voice && self.config.voice_replies {
                    self.synthesize(&reply.text).await
                } else {
                    None
                };
                BotReply::from_engine(reply, voice)
            }
            Err(e) => {
                log::error!("Error answering user {}: {}", user_id, e);
                BotReply::plain(APOLOGY_MESSAGE)
            }
        }
    }

    /// Continue a pending query after the user pressed a fallback button
    pub async fn process_follow_up(&self, user_id: u64, choice: FollowUp) -> BotReply {
        match self.run_turn(user_id, TurnInput::FollowUp(choice)).await {
            Ok(reply) => BotReply::from_engine(reply, None),
            Err(e) => {
                log::error!("Error handling follow-up for user {}: {}", user_id, e);
                BotReply::plain(APOLOGY_MESSAGE)
            }
        }
    }

    async fn run_turn(&self, user_id: u64, input: TurnInput) -> Result<EngineReply, BotError> {
        let handle = self.conversations.session(user_id).await;
        let mut session = handle.lock().await;

        // Work on a copy so a failed turn leaves the history untouched
        let mut draft = session.clone();
        let reply = match input {
            TurnInput::Text(text) => self.engine.respond(&mut draft, &text).await?,
            TurnInput::Image { caption, image } => {
                self.engine.analyze_image(&mut draft, &caption, image).await?
            }
            TurnInput::FollowUp(choice) => self.engine.follow_up(&mut draft, choice).await?,
        };
        *session = draft;

        let persisted = match self.conversations.persist(&session).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to persist history for user {}: {:#}", user_id, e);
                false
            }
        };
        drop(session);
        drop(handle);

        // A persisted session is reloaded from disk on the user's next message
        if persisted {
            self.conversations.release(user_id).await;
        }
        Ok(reply)
    }

    async fn synthesize(&self, text: &str) -> Option<Vec<u8>> {
        match self.speech.synthesize(&to_plain_text(text)).await {
            Ok(audio) => Some(audio),
            Err(e) => {
                log::warn!("Voice synthesis failed, sending text only: {}", e);
                None
            }
        }
    }

    pub async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String, BotError> {
        self.speech.transcribe(audio, file_name).await
    }

    pub async fn clear_history(&self, user_id: u64) -> BotReply {
        match self.conversations.clear(user_id).await {
            Ok(()) => BotReply::plain("✅ Conversation history cleared! Starting fresh."),
            Err(e) => {
                log::error!("Failed to clear history for user {}: {:#}", user_id, e);
                BotReply::plain(APOLOGY_MESSAGE)
            }
        }
    }

    pub fn help(&self, user_id: u64) -> BotReply {
        if self.is_admin(user_id) {
            BotReply::plain(&format!("{}{}", HELP_MESSAGE, ADMIN_HELP))
        } else {
            BotReply::plain(HELP_MESSAGE)
        }
    }

    /// Re-index the documents directory (administrators only)
    pub async fn ingest_documents(&self, user_id: u64) -> BotReply {
        if !self.is_admin(user_id) {
            log::warn!("User {} tried to run /ingest", user_id);
            return BotReply::plain(NOT_AUTHORIZED_MESSAGE);
        }

        match self.documents.ingest_directory().await {
            Ok(report) => BotReply::plain(&format_report(&report)),
            Err(e) => {
                log::error!("Ingestion failed: {}", e);
                BotReply::plain(&format!("❌ Ingestion failed: {}", e))
            }
        }
    }

    /// Store and index a document sent by an administrator
    pub async fn ingest_upload(&self, user_id: u64, file_name: &str, bytes: Vec<u8>) -> BotReply {
        if !self.is_admin(user_id) {
            log::warn!("User {} tried to upload {}", user_id, file_name);
            return BotReply::plain(NOT_AUTHORIZED_MESSAGE);
        }

        let result = match self.documents.store_upload(file_name, &bytes).await {
            Ok(path) => self.documents.ingest_path(&path).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(chunks) => BotReply::plain(&format!(
                "📚 {} added to the catalogs ({} chunks).",
                file_name, chunks
            )),
            Err(e) => {
                log::error!("Failed to ingest upload {}: {}", file_name, e);
                BotReply::plain(&format!("❌ Could not add {}: {}", file_name, e))
            }
        }
    }

    /// Knowledge base statistics (administrators only)
    pub async fn stats(&self, user_id: u64) -> BotReply {
        if !self.is_admin(user_id) {
            return BotReply::plain(NOT_AUTHORIZED_MESSAGE);
        }

        let chunks = match self.vector_store.count().await {
            Ok(count) => count.to_string(),
            Err(e) => {
                log::error!("Failed to count chunks: {}", e);
                "unavailable".to_string()
            }
        };
        let files = WalkDir::new(self.documents.documents_dir())
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .count();

        BotReply::plain(&format!(
            "📊 **Knowledge base**\n\
• Index backend: {}\n\
• Indexed chunks: {}\n\
• Files in the documents folder: {}\n\
• Chat model: {}\n\
• Embedding model: {}\n\
• Web search: {}",
            self.vector_store.backend(),
            chunks,
            files,
            self.config.llm_model,
            self.config.embedding_model,
            if self.engine.web_search_enabled() { "enabled" } else { "disabled" }
        ))
    }
}

fn format_report(report: &IngestReport) -> String {
    let mut text = format!(
        "📚 Ingested {} files ({} chunks).",
        report.files_ingested, report.chunks_added
    );
    if !report.skipped.is_empty() {
        text.push_str(&format!("\n\nSkipped {} files:", report.skipped.len()));
        for (path, reason) in &report.skipped {
            text.push_str(&format!("\n• {}: {}", path, reason));
        }
    }
    text
}

/// Check if the bot should respond to a message
///
/// Bot responds when:
/// 1. It's a private chat
/// 2. It is mentioned in the text or caption
/// 3. The message replies to one of the bot's messages
pub fn should_respond(me: &Me, message: &Message) -> bool {
    if message.chat.is_private() {
        return true;
    }

    let mention = format!("@{}", me.username());
    if let Some(text) = message.text().or_else(|| message.caption()) {
        if text
            .char_indices()
            .any(|(i, _)| mention_at(&text[i..], &mention))
        {
            return true;
        }
    }

    message
        .reply_to_message()
        .and_then(|reply| reply.from())
        .map_or(false, |author| author.id == me.id)
}

/// Telegram usernames are ASCII, so the match ignores ASCII case only and
/// never shifts byte offsets of the surrounding text.
fn mention_at(text: &str, mention: &str) -> bool {
    text.get(..mention.len())
        .map_or(false, |prefix| prefix.eq_ignore_ascii_case(mention))
}

/// Extract the actual query from a message by removing bot mentions
pub fn extract_query(bot_username: &str, text: &str) -> String {
    let mention = format!("@{}", bot_username);
    let mut query = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(c) = rest.chars().next() {
        if mention_at(rest, &mention) {
            rest = &rest[mention.len()..];
        } else {
            query.push(c);
            rest = &rest[c.len_utf8()..];
        }
    }
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn offers_keyboard(offers: &[FollowUp]) -> Option<InlineKeyboardMarkup> {
    if offers.is_empty() {
        return None;
    }
    let row = offers
        .iter()
        .map(|offer| InlineKeyboardButton::callback(offer.label(), offer.callback_data()))
        .collect::<Vec<_>>();
    Some(InlineKeyboardMarkup::new(vec![row]))
}

async fn download_file(bot: &Bot, file_id: &str) -> Result<Vec<u8>> {
    let file = bot.get_file(file_id).await?;
    let mut buf = Vec::new();
    bot.download_file(&file.path, &mut buf).await?;
    Ok(buf)
}

/// Send a reply, falling back to plain text if Telegram rejects the markup
pub async fn send_reply(bot: &Bot, chat_id: ChatId, reply: BotReply) -> Result<()> {
    let keyboard = offers_keyboard(&reply.offers);
    let last = reply.parts.len().saturating_sub(1);

    for (i, part) in reply.parts.iter().enumerate() {
        let markup = if i == last { keyboard.clone() } else { None };

        let mut request = bot
            .send_message(chat_id, part.clone())
            .parse_mode(ParseMode::Html);
        if let Some(markup) = markup.clone() {
            request = request.reply_markup(markup);
        }

        if let Err(e) = request.await {
            log::warn!("HTML reply rejected ({}), resending as plain text", e);
            let mut plain = bot.send_message(chat_id, strip_tags(part));
            if let Some(markup) = markup {
                plain = plain.reply_markup(markup);
            }
            plain.await?;
        }
    }

    if let Some(voice) = reply.voice {
        bot.send_voice(chat_id, InputFile::memory(voice)).await?;
    }
    Ok(())
}

/// Main message handler
///
/// This function:
/// 1. Checks if the bot should respond
/// 2. Routes admin document uploads to ingestion
/// 3. Normalizes photo, voice or text into a `UserQuery`
/// 4. Runs the conversation turn and sends the reply
pub async fn handle_message(
    bot: Bot,
    msg: Message,
    me: Me,
    processor: Arc<MessageProcessor>,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = user.id.0;

    if !should_respond(&me, &msg) {
        log::debug!("Skipping message in chat {} (not addressed to the bot)", msg.chat.id);
        return Ok(());
    }

    if let Some(document) = msg.document() {
        let file_name = document
            .file_name
            .clone()
            .unwrap_or_else(|| "upload.txt".to_string());
        if !processor.is_admin(user_id) {
            return send_reply(&bot, msg.chat.id, BotReply::plain(NOT_AUTHORIZED_MESSAGE)).await;
        }
        log::info!("Admin {} uploaded {}", user_id, file_name);
        bot.send_chat_action(msg.chat.id, ChatAction::Typing).await?;
        let bytes = download_file(&bot, &document.file.id).await?;
        let reply = processor.ingest_upload(user_id, &file_name, bytes).await;
        return send_reply(&bot, msg.chat.id, reply).await;
    }

    let query = if let Some(photos) = msg.photo() {
        // Telegram lists sizes from smallest to largest
        let Some(photo) = photos.last() else {
            return Ok(());
        };
        bot.send_chat_action(msg.chat.id, ChatAction::Typing).await?;
        let bytes = download_file(&bot, &photo.file.id).await?;
        UserQuery {
            text: extract_query(me.username(), msg.caption().unwrap_or_default()),
            image: Some(ImageAttachment {
                bytes,
                mime_type: "image/jpeg".to_string(),
            }),
            from_voice: false,
        }
    } else if let Some(voice) = msg.voice() {
        bot.send_chat_action(msg.chat.id, ChatAction::Typing).await?;
        let audio = download_file(&bot, &voice.file.id).await?;
        match processor.transcribe(audio, "voice.ogg").await {
            Ok(text) if !text.is_empty() => {
                log::info!("Transcribed voice message from user {}: {}", user_id, text);
                UserQuery {
                    text,
                    image: None,
                    from_voice: true,
                }
            }
            Ok(_) | Err(_) => {
                return send_reply(&bot, msg.chat.id, BotReply::plain(TRANSCRIPTION_FAILED_MESSAGE))
                    .await;
            }
        }
    } else if let Some(text) = msg.text() {
        let query = extract_query(me.username(), text);
        if query.is_empty() {
            log::debug!("Query is empty after removing mentions");
            return Ok(());
        }
        UserQuery::text(query)
    } else {
        return Ok(());
    };

    log::info!("Received query from user {} in chat {}: {}", user_id, msg.chat.id, query.text);

    // Send "typing" action to indicate bot is processing
    bot.send_chat_action(msg.chat.id, ChatAction::Typing).await?;

    let reply = processor.process(user_id, query).await;
    send_reply(&bot, msg.chat.id, reply).await
}

/// Handle a press on one of the fallback buttons
pub async fn handle_callback_query(
    bot: Bot,
    q: CallbackQuery,
    processor: Arc<MessageProcessor>,
) -> Result<()> {
    bot.answer_callback_query(q.id.clone()).await?;

    let Some(choice) = q.data.as_deref().and_then(FollowUp::from_callback_data) else {
        return Ok(());
    };
    let Some(message) = &q.message else {
        return Ok(());
    };
    let chat_id = message.chat.id;

    // Remove the buttons so the same choice can't be made twice
    if let Err(e) = bot.edit_message_reply_markup(chat_id, message.id).await {
        log::debug!("Could not remove fallback buttons: {}", e);
    }

    bot.send_chat_action(chat_id, ChatAction::Typing).await?;
    let reply = processor.process_follow_up(q.from.id.0, choice).await;
    send_reply(&bot, chat_id, reply).await
}

/// Handle the /start command
pub async fn handle_start_command(bot: Bot, msg: Message) -> Result<()> {
    send_reply(&bot, msg.chat.id, BotReply::plain(WELCOME_MESSAGE)).await
}

/// Handle the /help command
pub async fn handle_help_command(
    bot: Bot,
    msg: Message,
    processor: Arc<MessageProcessor>,
) -> Result<()> {
    let user_id = msg.from().map_or(0, |u| u.id.0);
    send_reply(&bot, msg.chat.id, processor.help(user_id)).await
}

/// Handle the /clear command to reset conversation history
pub async fn handle_clear_command(
    bot: Bot,
    msg: Message,
    processor: Arc<MessageProcessor>,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let reply = processor.clear_history(user.id.0).await;
    send_reply(&bot, msg.chat.id, reply).await
}

/// Handle the /ingest command
pub async fn handle_ingest_command(
    bot: Bot,
    msg: Message,
    processor: Arc<MessageProcessor>,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = user.id.0;
    if processor.is_admin(user_id) {
        bot.send_message(msg.chat.id, "⏳ Re-indexing the documents folder...")
            .await?;
    }
    let reply = processor.ingest_documents(user_id).await;
    send_reply(&bot, msg.chat.id, reply).await
}

/// Handle the /stats command
pub async fn handle_stats_command(
    bot: Bot,
    msg: Message,
    processor: Arc<MessageProcessor>,
) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let reply = processor.stats(user.id.0).await;
    send_reply(&bot, msg.chat.id, reply).await
}

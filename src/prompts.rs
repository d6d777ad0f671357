/// Prompt templates
///
/// Each template is a record whose required fields are checked when it is
/// built; `render` is a pure function of the record. The bot's persona lives
/// in [`system_prompt`] and is sent as the system message of every call.
use crate::error::{BotError, Result};
use crate::vector_store::ScoredChunk;
use crate::web_search::WebResult;

/// Fixed reply when the catalogs have nothing and the user is asked how to continue
pub const NO_CONTEXT_NOTICE: &str = "I couldn't find anything specific in the uploaded catalogs for this request.\n\n\
I can continue in one of these ways:\n\
1. Run a web search for up-to-date information.\n\
2. Answer from my general knowledge of film and TV.\n\
3. Narrow things down if you give me a few more details (title, year, platform).\n\n\
How would you like to continue?";

/// Fixed reply when neither the catalogs nor the web returned anything
pub const NO_INFORMATION_NOTICE: &str = "I found no information about this, neither in the uploaded catalogs nor on the web, \
so I won't guess titles, dates or links.\n\n\
I can answer from my general knowledge of film and TV instead, \
or you can narrow the request with more details (title, year, cast, platform).";

pub fn system_prompt(language: &str) -> String {
    format!(
        "You are Film&Series Bot, an up-to-date film and TV critic. Your only focus is the world of \
cinema and streaming services (Netflix, Prime Video, Disney+, Apple TV+, and so on). \
You are the trusted expert who always knows what to recommend for the evening.\n\
\n\
YOUR MISSION:\n\
1. Personal advice: suggest films, series and documentaries based on genre, mood and available time.\n\
2. Protect the experience: NEVER spoil. Discuss feeling, cinematography and performances, never plot twists.\n\
3. Expertise: when the question is about the entertainment world, give in-depth answers that do the work justice.\n\
\n\
CAPABILITIES:\n\
- Document catalogs (PDF, DOCX, TXT) uploaded by the administrators.\n\
- Real-time web search for news, upcoming releases and reviews.\n\
- Analysis of posters, screenshots and photos of actors.\n\
- Voice messages in and out.\n\
- Conversation memory for increasingly precise recommendations.\n\
\n\
TONE AND FORMAT:\n\
- Language: always answer in {language}.\n\
- Style: professional but passionate (plot twist, cliffhanger, vibe, binge-watching are welcome).\n\
- Formatting: use **bold** and *italic* to highlight titles and names.\n\
- Emoji: a few themed icons (🎬🍿👀).\n\
\n\
IMPORTANT:\n\
Never invent technical data (links, release dates, original titles). \
If a piece of information is not available to you, say so explicitly instead of guessing.",
        language = language
    )
}

fn require(template: &'static str, field: &'static str, value: &str) -> Result<String> {
    if value.trim().is_empty() {
        return Err(BotError::InvalidPrompt { template, field });
    }
    Ok(value.trim().to_string())
}

/// Retrieved chunks as numbered context blocks with their source
pub fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .enumerate()
        .map(|(i, scored)| {
            format!(
                "[Document {} | {} #{}]\n{}",
                i + 1,
                scored.chunk.metadata.source,
                scored.chunk.metadata.position + 1,
                scored.chunk.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn format_web_results(results: &[WebResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}\n{}\nURL: {}", i + 1, r.title, r.snippet, r.url))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Answer grounded in document chunks
#[derive(Debug, Clone)]
pub struct RagQueryPrompt {
    context: String,
    query: String,
}

impl RagQueryPrompt {
    pub fn new(context: &str, query: &str) -> Result<Self> {
        Ok(Self {
            context: require("rag_query", "context", context)?,
            query: require("rag_query", "query", query)?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "Answer the user's request using the data extracted from the analysed documents.\n\
\n\
REFERENCE DOCUMENTS:\n\
{context}\n\
\n\
USER QUESTION:\n\
{query}\n\
\n\
INSTRUCTIONS:\n\
1. Documents first: base the answer on the data in the context.\n\
2. Transparency: if the information is not in the files, say so clearly.\n\
3. Accuracy: report titles, links and technical details exactly as written, without omissions.\n\
\n\
ANSWER:",
            context = self.context,
            query = self.query
        )
    }
}

/// Answer grounded in web search results
#[derive(Debug, Clone)]
pub struct WebSearchPrompt {
    web_results: String,
    query: String,
}

impl WebSearchPrompt {
    pub fn new(web_results: &str, query: &str) -> Result<Self> {
        Ok(Self {
            web_results: require("web_search", "web_results", web_results)?,
            query: require("web_search", "query", query)?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "Analyse the web search results and give a professional update.\n\
\n\
SEARCH RESULTS:\n\
{web_results}\n\
\n\
QUERY:\n\
{query}\n\
\n\
INSTRUCTIONS:\n\
1. Summarise the most recent news.\n\
2. Link the sources as [text](URL), using only URLs that appear in the results above.\n\
3. Mention that the information was gathered in real time.\n\
4. If the results do not answer the question, say so; do not fill gaps with guesses.\n\
\n\
ANSWER:",
            web_results = self.web_results,
            query = self.query
        )
    }
}

/// Ungrounded answer from the model's general knowledge
#[derive(Debug, Clone)]
pub struct KnowledgePrompt {
    query: String,
}

impl KnowledgePrompt {
    pub fn new(query: &str) -> Result<Self> {
        Ok(Self {
            query: require("knowledge", "query", query)?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "No catalog document or web result is available for this request; answer from your \
general knowledge of film and TV.\n\
\n\
QUESTION:\n\
{query}\n\
\n\
INSTRUCTIONS:\n\
1. Make clear that the answer comes from general knowledge, not from the catalogs or the web.\n\
2. Do not provide links, and give dates or original titles only when you are certain of them; \
otherwise state that the information is not available.\n\
3. If the request is too vague, suggest how the user could narrow it.\n\
\n\
ANSWER:",
            query = self.query
        )
    }
}

/// Technical analysis of an image, optionally with the user's comment
#[derive(Debug, Clone)]
pub struct VisionAnalysisPrompt {
    caption: String,
}

impl VisionAnalysisPrompt {
    pub fn new(caption: &str) -> Self {
        let caption = caption.trim();
        Self {
            caption: if caption.is_empty() {
                "(none)".to_string()
            } else {
                caption.to_string()
            },
        }
    }

    pub fn render(&self) -> String {
        format!(
            "Analyse the film-related image and describe its visual elements.\n\
\n\
USER COMMENT: {caption}\n\
\n\
Provide a technical analysis including:\n\
1. Identification of the work or the actors (only if you can tell; otherwise say so).\n\
2. Aesthetic analysis and composition.\n\
3. Visible text or credits.\n\
\n\
Be descriptive and professional.",
            caption = self.caption
        )
    }
}

/// A question about an image
#[derive(Debug, Clone)]
pub struct VisionQuestionPrompt {
    question: String,
}

impl VisionQuestionPrompt {
    pub fn new(question: &str) -> Result<Self> {
        Ok(Self {
            question: require("vision_question", "question", question)?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "Answer the question based on the visual analysis of this image.\n\
\n\
QUESTION: {question}\n\
\n\
Give an accurate answer based on the visible details. \
If the image does not show what is needed, say so.",
            question = self.question
        )
    }
}

/// Rewrite a follow-up question so it stands on its own
#[derive(Debug, Clone)]
pub struct ContextualizePrompt {
    history: String,
    input: String,
}

impl ContextualizePrompt {
    pub fn new(history: &str, input: &str) -> Result<Self> {
        Ok(Self {
            history: require("contextualize", "history", history)?,
            input: require("contextualize", "input", input)?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "Given the chat history and the user's latest question, rewrite the question so that \
it can be understood on its own (standalone), without answering it.\n\
If the question is already standalone, return it unchanged.\n\
Reply with the question only.\n\
\n\
Example:\n\
- User: \"Who is the director?\" (after talking about Oppenheimer)\n\
- Output: \"Who is the director of the film Oppenheimer?\"\n\
\n\
Chat history:\n\
{history}\n\
\n\
Latest question: {input}\n\
\n\
Standalone question:",
            history = self.history,
            input = self.input
        )
    }
}

/// Collapse earlier turns into one summary
#[derive(Debug, Clone)]
pub struct SummarizePrompt {
    conversation: String,
}

impl SummarizePrompt {
    pub fn new(conversation: &str) -> Result<Self> {
        Ok(Self {
            conversation: require("summarize", "conversation", conversation)?,
        })
    }

    pub fn render(&self) -> String {
        format!(
            "Summarise the key points of the previous film discussion to keep the model's memory compact.\n\
\n\
Conversation:\n\
{conversation}\n\
\n\
Focus of the summary:\n\
1. Genres and titles of interest.\n\
2. Preferences expressed by the user.\n\
3. Technical information already provided.\n\
\n\
SUMMARY:",
            conversation = self.conversation
        )
    }
}

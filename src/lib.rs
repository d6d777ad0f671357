/// Film&Series Bot Library
///
/// A Telegram film and TV critic. Answers are grounded in administrator
/// uploaded catalogs through retrieval-augmented generation, with web search
/// and general knowledge as fallbacks, per-user conversation memory, image
/// analysis and voice messages.

pub mod bot;
pub mod client;
pub mod config;
pub mod conversation;
pub mod documents;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod http_server;
pub mod llm;
pub mod markup;
pub mod openai;
pub mod prompts;
pub mod speech;
pub mod vector_store;
pub mod web_search;

/// Film&Series Bot
///
/// A Telegram bot that acts as a film and TV critic.
///
/// The bot:
/// - Answers from administrator-uploaded catalogs (PDF, DOCX, TXT) via semantic search
/// - Falls back to web search or general knowledge when the catalogs have nothing
/// - Keeps per-user conversation memory, summarizing long histories
/// - Analyses posters and screenshots, transcribes voice messages
/// - Responds to mentions in group chats
use anyhow::{Context, Result};
use std::sync::Arc;

use film_series_bot::{
    bot,
    client::build_http_client,
    config::Config,
    conversation::{ConversationManager, HistoryBudget},
    documents::DocumentProcessor,
    engine::{ConversationEngine, EngineSettings},
    handlers::MessageProcessor,
    http_server::{start_server, AppState},
    openai::OpenAIClient,
    vector_store::{LocalVectorIndex, PgVectorIndex, VectorIndex, VectorStoreManager},
    web_search::{TavilySearch, WebSearch},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger
    pretty_env_logger::init();

    log::info!("Starting Film&Series Bot...");

    // Load configuration from environment
    let config = Config::from_env()?;
    config.prepare_directories()?;

    let http_client = build_http_client(&config)?;
    let openai = Arc::new(OpenAIClient::new(&config, http_client.clone()));

    let index: Arc<dyn VectorIndex> = match &config.database_url {
        Some(url) => Arc::new(
            PgVectorIndex::connect(url, &config.embeddings_table, config.embedding_dimensions)
                .await
                .context("Failed to initialize the pgvector index")?,
        ),
        None => Arc::new(
            LocalVectorIndex::open(&config.paths.vector_dir)
                .await
                .context("Failed to open the local vector index")?,
        ),
    };
    let vector_store = Arc::new(VectorStoreManager::new(
        openai.clone(),
        index,
        config.min_relevance,
    ));

    let documents = Arc::new(DocumentProcessor::new(
        vector_store.clone(),
        config.paths.documents_dir.clone(),
        config.chunk_size,
        config.chunk_overlap,
    ));

    let web_search = TavilySearch::from_config(&config, http_client)
        .map(|search| Arc::new(search) as Arc<dyn WebSearch>);
    if web_search.is_none() {
        log::warn!("TAVILY_API_KEY not set - web search fallback disabled");
    }

    let budget = HistoryBudget::new(config.memory_token_limit, config.memory_keep_recent)?;
    let engine = Arc::new(ConversationEngine::new(
        openai.clone(),
        vector_store.clone(),
        web_search,
        budget,
        EngineSettings::from_config(&config),
    ));

    let conversations = Arc::new(ConversationManager::new(config.paths.memory_dir.clone()));

    if config.auto_ingest {
        auto_ingest(&vector_store, &documents).await;
    }

    if let Some(port) = config.health_port {
        let state = AppState {
            vector_store: vector_store.clone(),
        };
        tokio::spawn(async move {
            if let Err(e) = start_server(state, port).await {
                log::error!("HTTP server stopped: {:#}", e);
            }
        });
    }

    let config = Arc::new(config);
    let processor = Arc::new(MessageProcessor::new(
        config.clone(),
        engine,
        conversations,
        documents,
        vector_store,
        openai,
    ));

    // Run the bot
    bot::run_bot(&config, processor).await?;

    Ok(())
}

/// Index the documents directory when the knowledge base is still empty
async fn auto_ingest(vector_store: &VectorStoreManager, documents: &DocumentProcessor) {
    match vector_store.count().await {
        Ok(0) => {
            log::info!(
                "Knowledge base is empty, ingesting {}",
                documents.documents_dir().display()
            );
            match documents.ingest_directory().await {
                Ok(report) => log::info!(
                    "Auto-ingest finished: {} files, {} chunks, {} skipped",
                    report.files_ingested,
                    report.chunks_added,
                    report.skipped.len()
                ),
                Err(e) => log::error!("Auto-ingest failed: {}", e),
            }
        }
        Ok(count) => log::info!("Knowledge base holds {} chunks", count),
        Err(e) => log::error!("Could not read the knowledge base size: {}", e),
    }
}

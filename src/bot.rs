/// Telegram bot module
///
/// Sets up the teloxide dispatcher: commands, incoming messages and presses on
/// the fallback buttons are routed to the handlers.
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use teloxide::{prelude::*, types::Me, utils::command::BotCommands};
use tokio::time::sleep;

use crate::config::Config;
use crate::handlers::{
    handle_callback_query, handle_clear_command, handle_help_command, handle_ingest_command,
    handle_message, handle_start_command, handle_stats_command, MessageProcessor,
};

/// Bot commands that users can use
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "Start the bot and see welcome message")]
    Start,
    #[command(description = "Show help information")]
    Help,
    #[command(description = "Clear conversation history")]
    Clear,
    #[command(description = "Re-index the documents folder (admins)")]
    Ingest,
    #[command(description = "Knowledge base statistics (admins)")]
    Stats,
}

/// Connect to Telegram and dispatch updates until Ctrl+C
pub async fn run_bot(config: &Config, processor: Arc<MessageProcessor>) -> Result<()> {
    log::info!("Initializing bot...");

    // Long polling holds requests open, so the timeout is well above Telegram's poll interval
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(10)
        .build()
        .context("Failed to create Telegram HTTP client")?;

    let bot = Bot::with_client(&config.telegram_token, client);

    let me = retry_get_me(&bot)
        .await
        .context("Failed to connect to Telegram API after multiple retries")?;
    log::info!("Bot started: @{}", me.username());

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        log::warn!("Could not register the command list: {}", e);
    }

    let handler = dptree::entry()
        // Handle commands
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(
                    |bot: Bot,
                     msg: Message,
                     cmd: Command,
                     processor: Arc<MessageProcessor>| async move {
                        let result = match cmd {
                            Command::Start => handle_start_command(bot, msg).await,
                            Command::Help => handle_help_command(bot, msg, processor).await,
                            Command::Clear => handle_clear_command(bot, msg, processor).await,
                            Command::Ingest => handle_ingest_command(bot, msg, processor).await,
                            Command::Stats => handle_stats_command(bot, msg, processor).await,
                        };
                        if let Err(e) = result {
                            log::error!("Error handling command: {:?}", e);
                        }
                        respond(())
                    },
                ),
        )
        // Handle regular messages: text, photos, voice notes and documents
        .branch(Update::filter_message().endpoint(
            |bot: Bot, msg: Message, me: Me, processor: Arc<MessageProcessor>| async move {
                if let Err(e) = handle_message(bot, msg, me, processor).await {
                    log::error!("Error handling message: {:?}", e);
                }
                respond(())
            },
        ))
        // Handle presses on the fallback buttons
        .branch(Update::filter_callback_query().endpoint(
            |bot: Bot, q: CallbackQuery, processor: Arc<MessageProcessor>| async move {
                if let Err(e) = handle_callback_query(bot, q, processor).await {
                    log::error!("Error handling callback query: {:?}", e);
                }
                respond(())
            },
        ));

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![processor, me.clone()])
        .enable_ctrlc_handler()
        .build();

    log::info!("Bot is running. Press Ctrl+C to stop.");
    dispatcher.dispatch().await;

    Ok(())
}

/// Retry getting bot info with exponential backoff
async fn retry_get_me(bot: &Bot) -> Result<Me> {
    let max_retries = 5;
    let mut delay = Duration::from_secs(2);

    log::info!("Attempting to connect to Telegram API...");

    for attempt in 1..=max_retries {
        match bot.get_me().await {
            Ok(me) => {
                log::info!("Successfully connected to Telegram API on attempt {}", attempt);
                return Ok(me);
            }
            Err(e) if attempt == max_retries => {
                log::error!("Check the bot token and that https://api.telegram.org is reachable");
                anyhow::bail!(
                    "Failed to connect to Telegram API after {} attempts: {}",
                    max_retries,
                    e
                );
            }
            Err(e) => {
                log::warn!(
                    "Telegram API not reachable (attempt {}/{}): {}. Retrying in {:?}...",
                    attempt,
                    max_retries,
                    e,
                    delay
                );
                sleep(delay).await;
                delay *= 2;
            }
        }
    }

    unreachable!("the last attempt always returns")
}

mod buffer;
mod config;
mod handler;
mod llm;
mod policy;
mod protocol;
mod telegram;
mod usage;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use buffer::MessageBuffer;
use config::BotConfig;
use handler::GroupChatHandler;
use llm::{GeminiBackend, ModelBackend};
use policy::CooldownGate;
use protocol::ResponseEngine;
use telegram::{ChatTransport, TelegramApi};

fn required_env(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .with_context(|| format!("{} must be set", name))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,gaffer=debug")),
        )
        .init();

    // Missing credentials are fatal here, before anything is spawned.
    let bot_token = required_env("TELEGRAM_BOT_TOKEN")?;
    let gemini_api_key = required_env("GEMINI_API_KEY")?;

    let config = Arc::new(BotConfig::load());

    let api = Arc::new(TelegramApi::new(&bot_token));
    let identity = api.get_me().await.context("Telegram getMe failed")?;
    tracing::info!(
        "{} is awake (@{}, replying to {:?})",
        config.bot_display_name,
        identity.username,
        config.address_keywords
    );

    let buffer = Arc::new(MessageBuffer::new(
        config.buffer_capacity,
        config.max_message_age(),
    ));
    let cooldown = Arc::new(CooldownGate::new(config.cooldown()));

    let backend = Arc::new(GeminiBackend::new(
        gemini_api_key,
        config.model.clone(),
        config.temperature,
        config.max_output_tokens,
        config.request_timeout(),
    ));

    let (usage_tx, usage_rx) = flume::unbounded();
    let engine = Arc::new(ResponseEngine::new(
        backend as Arc<dyn ModelBackend>,
        config.system_prompt.clone(),
        config.max_attempts,
        config.retry_delay(),
        config.prompt_offset(),
        usage_tx,
    ));

    let handler = Arc::new(GroupChatHandler::new(
        Arc::clone(&config),
        identity,
        Arc::clone(&buffer),
        cooldown,
        engine,
        Arc::clone(&api) as Arc<dyn ChatTransport>,
    ));

    let sweep_task = buffer.spawn_sweep(config.sweep_period());
    let usage_task = usage::spawn_usage_reporter(usage_rx, config.usage_report_period());

    tokio::select! {
        _ = telegram::run_polling(api, handler) => {}
        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received, {} goes to sleep", config.bot_display_name);
        }
    }

    // Stop accepting events and clear periodic timers; in-flight model calls
    // are not force-aborted, silence is their safe outcome either way.
    sweep_task.abort();
    usage_task.abort();

    Ok(())
}

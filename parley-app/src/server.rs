//! Server wiring: config, completion client, processor, adapters, gateway.

use crate::config::ParleyConfig;
use crate::gateway::Gateway;
use crate::processor::{MessageProcessor, ProcessorConfig};
use anyhow::Result;
use parley_channels::{
    ChannelAdapter, ConversationId, DiscordAdapter, OutboundMessage, TelegramAdapter,
};
use parley_llm::CompletionClient;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ParleyConfig::load(config_path).await?;
    tracing::info!(
        model = %cfg.completion.model,
        base_url = %cfg.completion.base_url,
        bot_name = %cfg.processor.bot_name,
        max_history = cfg.processor.max_history,
        batch_size = cfg.processor.batch_size,
        processing_timeout_secs = cfg.processor.processing_timeout_secs,
        rate_limit_delay_ms = cfg.processor.rate_limit_delay_ms,
        max_response_chars = cfg.processor.max_response_chars,
        stale_after_secs = cfg.processor.stale_after_secs,
        sweep_interval_secs = cfg.processor.sweep_interval_secs,
        telegram_enabled = cfg.channels.telegram.enabled,
        discord_enabled = cfg.channels.discord.enabled,
        "server configuration loaded"
    );

    let completer = Arc::new(build_completion_client(&cfg)?);
    let processor = Arc::new(MessageProcessor::new(completer, processor_config(&cfg)));

    let channels = build_enabled_channels(&cfg)?;
    if channels.is_empty() {
        return Err(anyhow::anyhow!(
            "no channel adapter is usable; configure channels.telegram or channels.discord"
        ));
    }

    let (inbound_tx, inbound_rx) = tokio::sync::mpsc::channel(1024);
    for (channel_id, adapter) in &channels {
        adapter.start(inbound_tx.clone()).await?;
        tracing::info!(channel = %channel_id, "channel adapter started");
    }
    drop(inbound_tx);

    let gateway = Arc::new(Gateway::new(
        cfg.completion.model.clone(),
        cfg.processor.bot_name.clone(),
        processor.clone(),
        channels,
        inbound_rx,
    ));
    let shutdown = CancellationToken::new();
    let gateway_handle = gateway.start(shutdown.child_token());
    tracing::info!("gateway started");

    let sweep_handle = spawn_sweeper(
        processor.clone(),
        Duration::from_secs(cfg.processor.sweep_interval_secs),
        Duration::from_secs(cfg.processor.stale_after_secs),
        shutdown.child_token(),
    );

    shutdown_signal(shutdown.clone()).await;

    match gateway_handle.await {
        Ok(()) => tracing::info!("gateway shutdown completed"),
        Err(e) => tracing::error!(error = %e, "gateway task join failed during shutdown"),
    }
    match sweep_handle.await {
        Ok(()) => tracing::info!("sweeper shutdown completed"),
        Err(e) => tracing::error!(error = %e, "sweeper task join failed during shutdown"),
    }

    Ok(())
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = ParleyConfig::load(config_path).await?;
    tracing::info!(
        model = %cfg.completion.model,
        base_url = %cfg.completion.base_url,
        telegram_usable = cfg.telegram_usable(),
        discord_usable = cfg.discord_usable(),
        "config ok"
    );
    Ok(())
}

pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    conversation_id: i64,
    message: &str,
) -> Result<()> {
    let cfg = ParleyConfig::load(config_path).await?;
    let adapter: Arc<dyn ChannelAdapter> = match channel {
        "telegram" => Arc::new(TelegramAdapter::new(&cfg.channels.telegram.bot_token)?),
        "discord" => Arc::new(DiscordAdapter::new(&cfg.channels.discord.bot_token)?),
        other => return Err(anyhow::anyhow!("unknown channel: {other}")),
    };
    adapter
        .send(
            ConversationId::new(conversation_id),
            OutboundMessage::text(message),
        )
        .await?;
    Ok(())
}

fn build_completion_client(cfg: &ParleyConfig) -> Result<CompletionClient> {
    let mut client = CompletionClient::new(
        &cfg.completion.base_url,
        &cfg.completion.api_key,
        &cfg.completion.model,
    )
    .with_request_timeout(Duration::from_secs(cfg.completion.request_timeout_secs));
    client.connect()?;
    Ok(client)
}

fn processor_config(cfg: &ParleyConfig) -> ProcessorConfig {
    ProcessorConfig {
        max_history: cfg.processor.max_history,
        batch_size: cfg.processor.batch_size,
        processing_timeout: Duration::from_secs(cfg.processor.processing_timeout_secs),
        rate_limit_delay: Duration::from_millis(cfg.processor.rate_limit_delay_ms),
        max_response_chars: cfg.processor.max_response_chars,
        max_tokens: cfg.completion.max_tokens,
        temperature: cfg.completion.temperature,
        system_prompt: cfg.processor.system_prompt.clone(),
        bot_name: cfg.processor.bot_name.clone(),
    }
}

fn build_enabled_channels(cfg: &ParleyConfig) -> Result<HashMap<String, Arc<dyn ChannelAdapter>>> {
    let mut channels: HashMap<String, Arc<dyn ChannelAdapter>> = HashMap::new();
    if cfg.telegram_usable() {
        let adapter = TelegramAdapter::new(&cfg.channels.telegram.bot_token)?;
        channels.insert(adapter.channel_id().to_string(), Arc::new(adapter));
    }
    if cfg.discord_usable() {
        let adapter = DiscordAdapter::new(&cfg.channels.discord.bot_token)?;
        channels.insert(adapter.channel_id().to_string(), Arc::new(adapter));
    }
    Ok(channels)
}

fn spawn_sweeper(
    processor: Arc<MessageProcessor>,
    interval: Duration,
    max_age: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick would sweep an empty map.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let evicted = processor.sweep_stale(max_age);
                    if evicted > 0 {
                        tracing::info!(evicted, "stale conversation sweep completed");
                    }
                }
            }
        }
    })
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

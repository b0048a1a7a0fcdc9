//! Inbound fan-in: every adapter feeds one queue; every reply goes back out
//! through the adapter that produced the message.

use crate::commands;
use crate::processor::MessageProcessor;
use anyhow::Result;
use parley_channels::{ChannelAdapter, InboundMessage, OutboundMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct Gateway {
    model: String,
    bot_name: String,
    processor: Arc<MessageProcessor>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    inbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>>,
    started_at: Instant,
}

impl Gateway {
    pub fn new(
        model: String,
        bot_name: String,
        processor: Arc<MessageProcessor>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        Self {
            model,
            bot_name,
            processor,
            channels,
            inbound_rx: Arc::new(tokio::sync::Mutex::new(inbound_rx)),
            started_at: Instant::now(),
        }
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
            tracing::info!("gateway loop exited");
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let msg = {
                let mut rx = self.inbound_rx.lock().await;
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = rx.recv() => msg,
                }
            };
            let Some(inbound) = msg else {
                return;
            };

            // One task per message: a slow completion in one conversation
            // must not stall the others.
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_inbound(inbound).await {
                    tracing::warn!(%e, "handle_inbound failed");
                }
            });
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(
            channel = %inbound.channel_id,
            conversation_id = %inbound.record.conversation_id,
        )
    )]
    async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let channel = self
            .channels
            .get(&inbound.channel_id)
            .ok_or_else(|| anyhow::anyhow!("unknown channel: {}", inbound.channel_id))?
            .clone();

        let conversation_id = inbound.record.conversation_id;
        let message_id = inbound.record.message_id;

        if let Some(reply) = commands::handle_command(
            &self.processor,
            &self.model,
            &self.bot_name,
            conversation_id,
            &inbound.record.content,
            self.started_at.elapsed(),
        ) {
            channel
                .send(
                    conversation_id,
                    OutboundMessage {
                        content: reply,
                        reply_to_message_id: Some(message_id),
                        mention: None,
                    },
                )
                .await?;
            return Ok(());
        }

        // Best-effort; a missed indicator is not worth failing the message.
        // A conversation mid-generation already shows one.
        let generating = self
            .processor
            .context(conversation_id)
            .is_some_and(|context| context.in_progress());
        if channel.supports_typing_events() && !generating {
            let typing_channel = channel.clone();
            tokio::spawn(async move {
                if let Err(e) = typing_channel.send_typing(conversation_id).await {
                    tracing::debug!(%e, "send_typing failed");
                }
            });
        }

        let is_group = inbound.is_group;
        let sender_handle = inbound.sender_handle.clone();
        let reply = self.processor.submit(inbound.record).await;
        if reply.is_empty() {
            return Ok(());
        }

        channel
            .send(
                conversation_id,
                OutboundMessage {
                    content: reply,
                    reply_to_message_id: Some(message_id),
                    mention: if is_group { sender_handle } else { None },
                },
            )
            .await?;
        Ok(())
    }
}

use crate::types::{ConversationId, InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "telegram", "discord".
    fn channel_id(&self) -> &str;

    /// Start receiving events. Push to tx for each forwarded message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a reply into a conversation on this platform.
    async fn send(&self, conversation_id: ConversationId, message: OutboundMessage) -> Result<()>;

    /// Show a typing indicator where supported.
    async fn send_typing(&self, _conversation_id: ConversationId) -> Result<()> {
        Err(anyhow::anyhow!(
            "send_typing is not supported by this channel"
        ))
    }

    fn supports_typing_events(&self) -> bool {
        false
    }
}

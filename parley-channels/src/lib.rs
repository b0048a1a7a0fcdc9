//! Platform adapters for Parley.
//!
//! Adapters are pure I/O: they convert platform message events to/from the
//! generic `ConversationRecord` / `OutboundMessage` shapes and decide which
//! events are worth forwarding at all.

mod discord;
mod telegram;
mod traits;
mod types;

pub use discord::DiscordAdapter;
pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{ConversationId, ConversationRecord, InboundMessage, OutboundMessage};

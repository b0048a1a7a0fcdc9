//! Chat command handling, shared by every platform.
//!
//! Commands are intercepted at the gateway before submission, so they never
//! reach the completion client.

use crate::processor::MessageProcessor;
use parley_channels::ConversationId;
use std::time::Duration;

pub fn handle_command(
    processor: &MessageProcessor,
    model: &str,
    bot_name: &str,
    conversation_id: ConversationId,
    input: &str,
    uptime: Duration,
) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }

    match trimmed {
        "/help" => Some(format!(
            "🤖 {bot_name}\n\
             Chat with me by sending a message; I keep the conversation context.\n\
             \n\
             Commands:\n\
             /help - show this help\n\
             /status - bot status\n\
             /clear - clear conversation context"
        )),
        "/status" => {
            let in_conversation = processor
                .context(conversation_id)
                .map(|context| context.len())
                .unwrap_or(0);
            Some(format!(
                "model={model}\nactive_conversations={}\nmessages_in_this_conversation={in_conversation}\nuptime={}",
                processor.active_conversations(),
                format_uptime(uptime),
            ))
        }
        "/clear" => {
            if processor.clear_conversation(conversation_id) {
                Some("🗑️ Conversation context cleared!".to_string())
            } else {
                Some("💭 No conversation context to clear.".to_string())
            }
        }
        _ => Some("Unknown command. Supported: /help /status /clear".to_string()),
    }
}

fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    format!("{}h {}m {}s", total / 3600, (total % 3600) / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::{format_uptime, handle_command};
    use crate::processor::{MessageProcessor, ProcessorConfig};
    use parley_channels::ConversationId;
    use parley_llm::{ChatMessage, Completer};
    use std::sync::Arc;
    use std::time::Duration;

    struct SilentCompleter;

    #[async_trait::async_trait]
    impl Completer for SilentCompleter {
        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _max_tokens: u32,
            _temperature: f32,
        ) -> parley_llm::Result<Option<String>> {
            Ok(Some("reply".to_string()))
        }
    }

    fn processor() -> MessageProcessor {
        let cfg = ProcessorConfig {
            rate_limit_delay: Duration::from_millis(10),
            ..ProcessorConfig::default()
        };
        MessageProcessor::new(Arc::new(SilentCompleter), cfg)
    }

    #[test]
    fn plain_messages_are_not_commands() {
        let processor = processor();
        let id = ConversationId::new(1);
        assert!(handle_command(&processor, "m", "Parley", id, "hello", Duration::ZERO).is_none());
        assert!(
            handle_command(&processor, "m", "Parley", id, "  spaced  ", Duration::ZERO).is_none()
        );
    }

    #[test]
    fn unknown_commands_get_the_supported_list() {
        let processor = processor();
        let reply = handle_command(
            &processor,
            "m",
            "Parley",
            ConversationId::new(1),
            "/frobnicate",
            Duration::ZERO,
        )
        .expect("commands always answer");
        assert!(reply.starts_with("Unknown command."));
    }

    #[test]
    fn status_reports_model_counts_and_uptime() {
        let processor = processor();
        let reply = handle_command(
            &processor,
            "gpt-4o-mini",
            "Parley",
            ConversationId::new(1),
            "/status",
            Duration::from_secs(3 * 3600 + 15 * 60 + 9),
        )
        .expect("status answers");
        assert!(reply.contains("model=gpt-4o-mini"));
        assert!(reply.contains("active_conversations=0"));
        assert!(reply.contains("messages_in_this_conversation=0"));
        assert!(reply.contains("uptime=3h 15m 9s"));
    }

    #[tokio::test]
    async fn clear_distinguishes_existing_and_missing_conversations() {
        let processor = processor();
        let id = ConversationId::new(7);

        let missing = handle_command(&processor, "m", "Parley", id, "/clear", Duration::ZERO)
            .expect("clear answers");
        assert_eq!(missing, "💭 No conversation context to clear.");

        processor
            .submit(parley_channels::ConversationRecord::bot(
                "Parley", id, "seed",
            ))
            .await;
        let cleared = handle_command(&processor, "m", "Parley", id, "/clear", Duration::ZERO)
            .expect("clear answers");
        assert_eq!(cleared, "🗑️ Conversation context cleared!");
    }

    #[test]
    fn uptime_formats_as_hours_minutes_seconds() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0h 0m 0s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "0h 0m 59s");
        assert_eq!(format_uptime(Duration::from_secs(3661)), "1h 1m 1s");
    }
}

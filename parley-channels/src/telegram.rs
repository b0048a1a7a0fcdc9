use crate::traits::ChannelAdapter;
use crate::types::{ConversationId, ConversationRecord, InboundMessage, OutboundMessage};
use anyhow::Result;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;

const TELEGRAM_CHANNEL_ID: &str = "telegram";
const TELEGRAM_LONG_POLL_TIMEOUT_SECS: &str = "30";
const TELEGRAM_ALLOWED_UPDATES: &str = r#"["message"]"#;
const TELEGRAM_FALLBACK_AUTHOR: &str = "Unknown";
const TELEGRAM_NON_TRANSIENT_DELAY: Duration = Duration::from_secs(10);
const TELEGRAM_RETRY_BASE_MS: u64 = 250;
const TELEGRAM_RETRY_MAX_MS: u64 = 30_000;

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, method: &str) -> Result<Url> {
        Ok(Url::parse(&format!(
            "https://api.telegram.org/bot{}/{}",
            self.bot_token, method
        ))?)
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn channel_id(&self) -> &str {
        TELEGRAM_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_poll_loop(tx).await {
                tracing::error!(%e, "telegram poll loop exited");
            }
        });
        Ok(())
    }

    async fn send(&self, conversation_id: ConversationId, message: OutboundMessage) -> Result<()> {
        let url = self.api_url("sendMessage")?;
        let text = compose_reply_text(&message);
        let mut body = serde_json::json!({
            "chat_id": conversation_id.as_i64(),
            "text": text,
        });
        if let Some(reply_to) = message.reply_to_message_id {
            body["reply_to_message_id"] = reply_to.into();
        }
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "telegram send failed: status={status} body={text}"
            ));
        }
        Ok(())
    }

    async fn send_typing(&self, conversation_id: ConversationId) -> Result<()> {
        let url = self.api_url("sendChatAction")?;
        let body = serde_json::json!({
            "chat_id": conversation_id.as_i64(),
            "action": "typing",
        });
        let resp = self.http.post(url).json(&body).send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(anyhow::anyhow!("telegram sendChatAction failed: status={status}"));
        }
        Ok(())
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}

impl TelegramAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_poll_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut offset: i64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let url = self.api_url("getUpdates")?;
            let response = match self
                .http
                .get(url)
                .query(&[
                    ("timeout", TELEGRAM_LONG_POLL_TIMEOUT_SECS),
                    ("offset", &offset.to_string()),
                    ("allowed_updates", TELEGRAM_ALLOWED_UPDATES),
                ])
                .send()
                .await
            {
                Ok(response) => response,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates request failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|error| {
                    format!("<failed to read telegram error body: {error}>")
                });
                if is_transient_status(status) {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %status,
                        %body,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates transient failure; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    consecutive_failures = 0;
                    tracing::error!(
                        %status,
                        %body,
                        ?TELEGRAM_NON_TRANSIENT_DELAY,
                        "telegram getUpdates non-transient failure; keeping poll loop alive"
                    );
                    tokio::time::sleep(TELEGRAM_NON_TRANSIENT_DELAY).await;
                }
                continue;
            }

            let parsed = match response.json::<TelegramGetUpdatesResponse>().await {
                Ok(parsed) => parsed,
                Err(error) => {
                    consecutive_failures += 1;
                    let delay = transient_retry_delay(consecutive_failures);
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        ?delay,
                        "telegram getUpdates payload parse failed; retrying with backoff"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            consecutive_failures = 0;

            let mut updates = parsed.result;
            updates.sort_by_key(|update| update.update_id);
            for update in updates {
                // Advance offset before conversion to avoid poison-update replay loops.
                if update.update_id < offset {
                    continue;
                }
                offset = update.update_id.saturating_add(1);

                if let Some(inbound) = build_inbound(&update) {
                    tx.send(inbound)
                        .await
                        .map_err(|e| anyhow::anyhow!("telegram inbound queue closed: {e}"))?;
                }
            }
        }
    }
}

fn transient_retry_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.saturating_sub(1).min(10);
    Duration::from_millis((TELEGRAM_RETRY_BASE_MS * multiplier).min(TELEGRAM_RETRY_MAX_MS))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

/// Forwarding policy: text messages from human senders only. Commands pass
/// through as text; the gateway owns command handling.
fn build_inbound(update: &TelegramUpdate) -> Option<InboundMessage> {
    let message = update.message.as_ref()?;
    let chat = message.chat.as_ref()?;
    let text = message.text.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
    if message.from.as_ref().is_some_and(|user| user.is_bot) {
        return None;
    }

    let record = ConversationRecord {
        content: text.to_string(),
        author: author_display_name(message.from.as_ref()),
        timestamp: message_timestamp(message.date),
        conversation_id: ConversationId::new(chat.id),
        message_id: message.message_id,
        is_bot: false,
    };

    Some(InboundMessage {
        channel_id: TELEGRAM_CHANNEL_ID.to_string(),
        record,
        is_group: chat.r#type != "private",
        sender_handle: message
            .from
            .as_ref()
            .and_then(|user| user.username.clone())
            .map(|username| format!("@{username}")),
    })
}

fn author_display_name(user: Option<&TelegramUser>) -> String {
    let Some(user) = user else {
        return TELEGRAM_FALLBACK_AUTHOR.to_string();
    };
    user.first_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| user.username.clone())
        .unwrap_or_else(|| TELEGRAM_FALLBACK_AUTHOR.to_string())
}

fn message_timestamp(date: i64) -> DateTime<Utc> {
    if date > 0 {
        DateTime::<Utc>::from_timestamp(date, 0).unwrap_or_else(Utc::now)
    } else {
        Utc::now()
    }
}

/// Group replies ping the triggering sender; private chats get plain text.
fn compose_reply_text(message: &OutboundMessage) -> String {
    match message.mention.as_deref() {
        Some(mention) => format!("{mention} {}", message.content),
        None => message.content.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct TelegramGetUpdatesResponse {
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: i64,
    #[serde(default)]
    date: i64,
    #[serde(default)]
    from: Option<TelegramUser>,
    #[serde(default)]
    chat: Option<TelegramChat>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramUser {
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type", default)]
    r#type: String,
}

#[cfg(test)]
mod tests {
    use super::{
        TelegramChat, TelegramMessage, TelegramUpdate, TelegramUser, build_inbound,
        compose_reply_text, transient_retry_delay,
    };
    use crate::types::OutboundMessage;

    fn update_with_message(message: TelegramMessage) -> TelegramUpdate {
        TelegramUpdate {
            update_id: 100,
            message: Some(message),
        }
    }

    fn text_message(text: &str) -> TelegramMessage {
        TelegramMessage {
            message_id: 5,
            date: 1_700_000_000,
            from: Some(TelegramUser {
                is_bot: false,
                first_name: Some("Alice".to_string()),
                username: Some("alice_w".to_string()),
            }),
            chat: Some(TelegramChat {
                id: 777,
                r#type: "supergroup".to_string(),
            }),
            text: Some(text.to_string()),
        }
    }

    #[test]
    fn retry_delay_grows_exponentially_and_caps() {
        assert_eq!(transient_retry_delay(1).as_millis(), 250);
        assert_eq!(transient_retry_delay(2).as_millis(), 500);
        assert_eq!(transient_retry_delay(3).as_millis(), 1000);
        assert_eq!(transient_retry_delay(20).as_millis(), 30000);
    }

    #[test]
    fn forwards_trimmed_text_with_author_and_group_facts() {
        let inbound = build_inbound(&update_with_message(text_message("  hello there  ")))
            .expect("text message forwards");
        assert_eq!(inbound.record.content, "hello there");
        assert_eq!(inbound.record.author, "Alice");
        assert_eq!(inbound.record.conversation_id.as_i64(), 777);
        assert_eq!(inbound.record.message_id, 5);
        assert!(!inbound.record.is_bot);
        assert!(inbound.is_group);
        assert_eq!(inbound.sender_handle.as_deref(), Some("@alice_w"));
    }

    #[test]
    fn skips_empty_text_and_non_text_messages() {
        assert!(build_inbound(&update_with_message(text_message("   "))).is_none());

        let mut message = text_message("hi");
        message.text = None;
        assert!(build_inbound(&update_with_message(message)).is_none());
    }

    #[test]
    fn skips_messages_from_other_bots() {
        let mut message = text_message("beep");
        if let Some(from) = message.from.as_mut() {
            from.is_bot = true;
        }
        assert!(build_inbound(&update_with_message(message)).is_none());
    }

    #[test]
    fn author_falls_back_to_username_then_placeholder() {
        let mut message = text_message("hi");
        if let Some(from) = message.from.as_mut() {
            from.first_name = None;
        }
        let inbound = build_inbound(&update_with_message(message)).expect("forwards");
        assert_eq!(inbound.record.author, "alice_w");

        let mut message = text_message("hi");
        message.from = None;
        let inbound = build_inbound(&update_with_message(message)).expect("forwards");
        assert_eq!(inbound.record.author, "Unknown");
        assert!(inbound.sender_handle.is_none());
    }

    #[test]
    fn private_chats_are_not_groups() {
        let mut message = text_message("hi");
        message.chat = Some(TelegramChat {
            id: 42,
            r#type: "private".to_string(),
        });
        let inbound = build_inbound(&update_with_message(message)).expect("forwards");
        assert!(!inbound.is_group);
    }

    #[test]
    fn group_replies_are_prefixed_with_the_mention() {
        let mut message = OutboundMessage::text("sure thing");
        message.mention = Some("@alice_w".to_string());
        assert_eq!(compose_reply_text(&message), "@alice_w sure thing");

        message.mention = None;
        assert_eq!(compose_reply_text(&message), "sure thing");
    }
}

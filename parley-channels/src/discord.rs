use crate::traits::ChannelAdapter;
use crate::types::{ConversationId, ConversationRecord, InboundMessage, OutboundMessage};
use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_tungstenite::tungstenite::Message;

const DISCORD_CHANNEL_ID: &str = "discord";
const DISCORD_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";
const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
// GUILD_MESSAGES, DIRECT_MESSAGES, MESSAGE_CONTENT.
const DISCORD_GATEWAY_INTENTS: u64 = (1 << 9) | (1 << 12) | (1 << 15);
const RECONNECT_BASE_SECS: u64 = 1;
const RECONNECT_MAX_SECS: u64 = 60;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;
type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;

#[derive(Clone)]
pub struct DiscordAdapter {
    http: reqwest::Client,
    bot_token: String,
}

impl DiscordAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{DISCORD_API_BASE}{path}")
    }
}

#[async_trait::async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn channel_id(&self) -> &str {
        DISCORD_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let adapter = self.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.run_gateway_loop(tx).await {
                tracing::error!(%e, "discord gateway loop exited");
            }
        });
        Ok(())
    }

    /// Replies land as plain channel messages. Discord threads the channel
    /// already, so neither the mention prefix nor reply quoting is applied.
    async fn send(&self, conversation_id: ConversationId, message: OutboundMessage) -> Result<()> {
        let url = self.api_url(&format!("/channels/{}/messages", conversation_id.as_i64()));
        let body = serde_json::json!({ "content": message.content });
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(anyhow::anyhow!(
                "discord send failed: status={status} body={text}"
            ));
        }
        Ok(())
    }

    async fn send_typing(&self, conversation_id: ConversationId) -> Result<()> {
        let url = self.api_url(&format!("/channels/{}/typing", conversation_id.as_i64()));
        let resp = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.bot_token))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            return Err(anyhow::anyhow!("discord typing failed: status={status}"));
        }
        Ok(())
    }

    fn supports_typing_events(&self) -> bool {
        true
    }
}

impl DiscordAdapter {
    #[tracing::instrument(level = "info", skip_all)]
    async fn run_gateway_loop(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        let mut consecutive_failures: u32 = 0;

        loop {
            if tx.is_closed() {
                return Err(anyhow::anyhow!("discord inbound queue closed"));
            }
            match self.run_gateway_once(&tx).await {
                Ok(()) => {
                    consecutive_failures = 0;
                    tracing::info!("discord gateway session ended; reconnecting");
                }
                Err(error) => {
                    consecutive_failures += 1;
                    tracing::warn!(
                        %error,
                        attempt = consecutive_failures,
                        "discord gateway session failed; reconnecting with backoff"
                    );
                }
            }
            tokio::time::sleep(reconnect_delay(consecutive_failures)).await;
        }
    }

    async fn run_gateway_once(&self, tx: &mpsc::Sender<InboundMessage>) -> Result<()> {
        let (ws, _) = tokio_tungstenite::connect_async(DISCORD_GATEWAY_URL).await?;
        let (write, mut read) = ws.split();
        let write = Arc::new(Mutex::new(write));

        // HELLO arrives first and carries the heartbeat cadence.
        let heartbeat_interval_ms: u64 = if let Some(msg) = read.next().await {
            let msg = msg?;
            let v: serde_json::Value = serde_json::from_str(msg.to_text()?)?;
            v.get("d")
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|x| x.as_u64())
                .ok_or_else(|| anyhow::anyhow!("discord HELLO missing heartbeat_interval"))?
        } else {
            return Err(anyhow::anyhow!("discord gateway closed before HELLO"));
        };

        // IDENTIFY.
        let identify = serde_json::json!({
            "op": 2,
            "d": {
                "token": format!("Bot {}", self.bot_token),
                "intents": DISCORD_GATEWAY_INTENTS,
                "properties": { "os": "linux", "browser": "parley", "device": "parley" }
            }
        });
        write
            .lock()
            .await
            .send(Message::Text(identify.to_string().into()))
            .await?;

        let seq: Arc<RwLock<Option<i64>>> = Arc::new(RwLock::new(None));

        let heartbeat = {
            let write = write.clone();
            let seq = seq.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_millis(heartbeat_interval_ms));
                loop {
                    interval.tick().await;
                    let s = *seq.read().await;
                    let payload = serde_json::json!({ "op": 1, "d": s });
                    if write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            })
        };

        let outcome = self.read_events(&mut read, &write, &seq, tx).await;
        // A heartbeat task left running would keep a dead session's socket warm.
        heartbeat.abort();
        outcome
    }

    async fn read_events(
        &self,
        read: &mut WsRead,
        write: &Mutex<WsWrite>,
        seq: &RwLock<Option<i64>>,
        tx: &mpsc::Sender<InboundMessage>,
    ) -> Result<()> {
        let mut bot_user_id: Option<String> = None;

        while let Some(msg) = read.next().await {
            let text = match msg? {
                Message::Text(text) => text,
                Message::Close(frame) => {
                    tracing::info!(?frame, "discord gateway closed by server");
                    return Ok(());
                }
                _ => continue,
            };
            let v: serde_json::Value = serde_json::from_str(text.as_str())?;

            if let Some(s) = v.get("s").and_then(|s| s.as_i64()) {
                *seq.write().await = Some(s);
            }

            let op = v
                .get("op")
                .and_then(|o| o.as_i64())
                .ok_or_else(|| anyhow::anyhow!("discord payload missing op"))?;
            match op {
                // Immediate heartbeat request.
                1 => {
                    let s = *seq.read().await;
                    let payload = serde_json::json!({ "op": 1, "d": s });
                    write
                        .lock()
                        .await
                        .send(Message::Text(payload.to_string().into()))
                        .await?;
                    continue;
                }
                // RECONNECT and INVALID_SESSION both want a fresh session.
                7 | 9 => {
                    tracing::info!(op, "discord gateway requested a new session");
                    return Ok(());
                }
                11 => continue,
                _ => {}
            }

            let t = v.get("t").and_then(|t| t.as_str());
            match t {
                Some("READY") => {
                    bot_user_id = v
                        .get("d")
                        .and_then(|d| d.get("user"))
                        .and_then(|u| u.get("id"))
                        .and_then(|id| id.as_str())
                        .map(|s| s.to_string());
                    tracing::info!(bot_user_id = ?bot_user_id, "discord gateway ready");
                }
                Some("MESSAGE_CREATE") => {
                    let event_payload = v
                        .get("d")
                        .cloned()
                        .ok_or_else(|| anyhow::anyhow!("discord MESSAGE_CREATE missing payload"))?;
                    let event: DiscordMessageCreate = serde_json::from_value(event_payload)?;
                    if let Some(inbound) = build_inbound(event, bot_user_id.as_deref()) {
                        tx.send(inbound)
                            .await
                            .map_err(|e| anyhow::anyhow!("discord inbound queue closed: {e}"))?;
                    }
                }
                Some(_) | None => {}
            }
        }

        Err(anyhow::anyhow!("discord gateway stream ended unexpectedly"))
    }
}

fn reconnect_delay(consecutive_failures: u32) -> Duration {
    let multiplier = 1_u64 << consecutive_failures.min(6);
    Duration::from_secs((RECONNECT_BASE_SECS * multiplier).min(RECONNECT_MAX_SECS))
}

fn build_inbound(
    event: DiscordMessageCreate,
    bot_user_id: Option<&str>,
) -> Option<InboundMessage> {
    if !should_forward(&event, bot_user_id) {
        return None;
    }
    let content = strip_bot_mentions(&event.content, bot_user_id);
    if content.is_empty() {
        return None;
    }
    let conversation_id = parse_snowflake(&event.channel_id, "channel_id")?;
    let message_id = parse_snowflake(&event.id, "message_id")?;

    let record = ConversationRecord {
        content,
        author: author_display_name(&event.author),
        timestamp: message_timestamp(event.timestamp.as_deref()),
        conversation_id: ConversationId::new(conversation_id),
        message_id,
        is_bot: false,
    };

    Some(InboundMessage {
        channel_id: DISCORD_CHANNEL_ID.to_string(),
        record,
        is_group: event.guild_id.is_some(),
        sender_handle: None,
    })
}

/// Guild messages must address the bot, by mention or by replying to one of
/// its messages. Direct messages always forward. Until READY delivers the bot
/// user id neither trigger can be detected, so guild traffic is dropped
/// rather than answered indiscriminately.
fn should_forward(event: &DiscordMessageCreate, bot_user_id: Option<&str>) -> bool {
    if event.author.bot {
        return false;
    }
    if event.guild_id.is_none() {
        return true;
    }
    let Some(bot_id) = bot_user_id else {
        return false;
    };
    mentions_user(&event.content, bot_id) || is_reply_to(event, bot_id)
}

fn mentions_user(content: &str, user_id: &str) -> bool {
    content.contains(&format!("<@{user_id}>")) || content.contains(&format!("<@!{user_id}>"))
}

fn is_reply_to(event: &DiscordMessageCreate, user_id: &str) -> bool {
    event
        .referenced_message
        .as_ref()
        .and_then(|referenced| referenced.author.as_ref())
        .is_some_and(|author| author.id == user_id)
}

fn strip_bot_mentions(content: &str, bot_user_id: Option<&str>) -> String {
    let Some(bot_id) = bot_user_id else {
        return content.trim().to_string();
    };
    content
        .replace(&format!("<@{bot_id}>"), "")
        .replace(&format!("<@!{bot_id}>"), "")
        .trim()
        .to_string()
}

fn author_display_name(author: &DiscordUser) -> String {
    author
        .global_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| author.username.clone())
}

fn message_timestamp(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

fn parse_snowflake(raw: &str, field: &'static str) -> Option<i64> {
    match raw.parse::<i64>() {
        Ok(value) => Some(value),
        Err(error) => {
            tracing::warn!(
                %error,
                field,
                raw,
                "discord snowflake did not fit an i64; dropping event"
            );
            None
        }
    }
}

#[derive(Debug, Deserialize)]
struct DiscordMessageCreate {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    content: String,
    author: DiscordUser,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    referenced_message: Option<DiscordMessageReference>,
}

#[derive(Debug, Default, Deserialize)]
struct DiscordUser {
    #[serde(default)]
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    global_name: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordMessageReference {
    #[serde(default)]
    author: Option<DiscordUser>,
}

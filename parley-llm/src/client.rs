use crate::error::{CompletionError, Result};
use crate::types::{ChatMessage, Usage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_MAX_TOKENS: u32 = 500;
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

/// Seam between reply generation and the completion endpoint.
///
/// `Ok(None)` means the call failed in a recoverable way (non-2xx, transport,
/// malformed body) and was already logged. `Err` is reserved for caller bugs
/// such as [`CompletionError::NotConnected`].
#[async_trait]
pub trait Completer: Send + Sync {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Option<String>>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
///
/// Holds one persistent HTTP connection pool for its whole active lifetime;
/// `connect` must run before the first `generate`.
pub struct CompletionClient {
    base_url: String,
    api_key: String,
    model: String,
    request_timeout: Duration,
    http: Option<reqwest::Client>,
}

impl CompletionClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            http: None,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Acquire the connection pool. The pool is released when the client is
    /// dropped.
    pub fn connect(&mut self) -> Result<()> {
        let http = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()?;
        self.http = Some(http);
        tracing::info!(
            base_url = %self.base_url,
            model = %self.model,
            "completion client connected"
        );
        Ok(())
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn request_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let http = self.http.as_ref().ok_or(CompletionError::NotConnected)?;

        let req = ChatCompletionRequest {
            model: &self.model,
            messages,
            max_tokens,
            temperature,
            stream: false,
        };

        let response = http
            .post(format!("{}{CHAT_COMPLETIONS_PATH}", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CompletionError::Http(format!(
                "chat completions status={status} body={}",
                truncate_for_log(&body)
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)?;
        if let Some(usage) = parsed.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "completion usage"
            );
        }
        extract_content(parsed)
    }
}

#[async_trait]
impl Completer for CompletionClient {
    async fn generate(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Option<String>> {
        match self.request_chat(messages, max_tokens, temperature).await {
            Ok(text) => Ok(Some(text)),
            Err(CompletionError::NotConnected) => Err(CompletionError::NotConnected),
            Err(e) => {
                tracing::error!(error = %e, "completion request failed");
                Ok(None)
            }
        }
    }
}

fn extract_content(response: ChatCompletionResponse) -> Result<String> {
    let choice = response.choices.into_iter().next().ok_or_else(|| {
        CompletionError::ResponseFormat("completion response missing choices".to_string())
    })?;
    let content = choice.message.content.ok_or_else(|| {
        CompletionError::ResponseFormat("completion choice missing content".to_string())
    })?;
    Ok(content.trim().to_string())
}

fn truncate_for_log(body: &str) -> &str {
    let limit = 512;
    match body.char_indices().nth(limit) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: ChoiceMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

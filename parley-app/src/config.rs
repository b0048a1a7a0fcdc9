//! Parley configuration loader.
//!
//! Every field has a default, so the config file itself is optional: a bot
//! can run from environment variables alone.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub processor: ProcessorSettings,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorSettings {
    /// Records kept per conversation; the oldest is evicted on overflow.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_processing_timeout_secs")]
    pub processing_timeout_secs: u64,
    #[serde(default = "default_rate_limit_delay_ms")]
    pub rate_limit_delay_ms: u64,
    #[serde(default = "default_max_response_chars")]
    pub max_response_chars: usize,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_bot_name")]
    pub bot_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelsConfig {
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub discord: DiscordConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bot_token: String,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.7
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_history() -> usize {
    20
}

fn default_batch_size() -> usize {
    5
}

fn default_processing_timeout_secs() -> u64 {
    25
}

fn default_rate_limit_delay_ms() -> u64 {
    500
}

fn default_max_response_chars() -> usize {
    2000
}

fn default_stale_after_secs() -> u64 {
    1800
}

fn default_sweep_interval_secs() -> u64 {
    300
}

fn default_system_prompt() -> String {
    "You are Parley, a conversational assistant chatting in Discord and Telegram. \
     Keep replies natural, engaging, and sized for chat. \
     Be friendly but not overly enthusiastic."
        .to_string()
}

fn default_bot_name() -> String {
    "Parley".to_string()
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            max_history: default_max_history(),
            batch_size: default_batch_size(),
            processing_timeout_secs: default_processing_timeout_secs(),
            rate_limit_delay_ms: default_rate_limit_delay_ms(),
            max_response_chars: default_max_response_chars(),
            stale_after_secs: default_stale_after_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            system_prompt: default_system_prompt(),
            bot_name: default_bot_name(),
        }
    }
}

impl ParleyConfig {
    /// An explicit path must exist; the default path is optional and falls
    /// back to built-in defaults so env-only deployments work.
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (default_config_path(), false),
        };

        let mut cfg: ParleyConfig = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => toml::from_str(&contents)
                .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(config_path = %path.display(), "no config file; using defaults");
                ParleyConfig::default()
            }
            Err(e) => return Err(anyhow::anyhow!("read config {}: {e}", path.display())),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PARLEY_API_KEY") {
            if !v.trim().is_empty() {
                self.completion.api_key = v;
            }
        }
        if let Ok(v) = std::env::var("PARLEY_BASE_URL") {
            if !v.trim().is_empty() {
                self.completion.base_url = v;
            }
        }
        if let Ok(v) = std::env::var("PARLEY_MODEL") {
            if !v.trim().is_empty() {
                self.completion.model = v;
            }
        }
        if let Ok(v) = std::env::var("PARLEY_SYSTEM_PROMPT") {
            if !v.trim().is_empty() {
                self.processor.system_prompt = v;
            }
        }
        if let Ok(v) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !v.trim().is_empty() {
                self.channels.telegram.bot_token = v;
                self.channels.telegram.enabled = true;
            }
        }
        if let Ok(v) = std::env::var("DISCORD_BOT_TOKEN") {
            if !v.trim().is_empty() {
                self.channels.discord.bot_token = v;
                self.channels.discord.enabled = true;
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.completion.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "completion.api_key is required (or set PARLEY_API_KEY)"
            ));
        }
        if !self.telegram_usable() && !self.discord_usable() {
            return Err(anyhow::anyhow!(
                "no channel is usable: enable channels.telegram or channels.discord with a bot_token"
            ));
        }
        if self.processor.max_history == 0 {
            return Err(anyhow::anyhow!("processor.max_history must be > 0"));
        }
        if self.processor.batch_size == 0 {
            return Err(anyhow::anyhow!("processor.batch_size must be > 0"));
        }
        if self.processor.max_response_chars < 4 {
            return Err(anyhow::anyhow!(
                "processor.max_response_chars must leave room for a truncation marker"
            ));
        }
        Ok(())
    }

    pub fn telegram_usable(&self) -> bool {
        self.channels.telegram.enabled && !self.channels.telegram.bot_token.trim().is_empty()
    }

    pub fn discord_usable(&self) -> bool {
        self.channels.discord.enabled && !self.channels.discord.bot_token.trim().is_empty()
    }
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".parley").join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::ParleyConfig;

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = ParleyConfig::default();
        assert_eq!(cfg.completion.base_url, "https://api.openai.com/v1");
        assert_eq!(cfg.completion.model, "gpt-4o-mini");
        assert_eq!(cfg.completion.max_tokens, 500);
        assert_eq!(cfg.completion.request_timeout_secs, 60);
        assert_eq!(cfg.processor.max_history, 20);
        assert_eq!(cfg.processor.batch_size, 5);
        assert_eq!(cfg.processor.processing_timeout_secs, 25);
        assert_eq!(cfg.processor.rate_limit_delay_ms, 500);
        assert_eq!(cfg.processor.max_response_chars, 2000);
        assert_eq!(cfg.processor.stale_after_secs, 1800);
        assert_eq!(cfg.processor.sweep_interval_secs, 300);
        assert_eq!(cfg.processor.bot_name, "Parley");
        assert!(!cfg.channels.telegram.enabled);
        assert!(!cfg.channels.discord.enabled);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: ParleyConfig = toml::from_str(
            r#"
            [completion]
            api_key = "sk-test"
            model = "gpt-4o"

            [channels.telegram]
            enabled = true
            bot_token = "123:abc"
            "#,
        )
        .expect("parses");
        assert_eq!(cfg.completion.api_key, "sk-test");
        assert_eq!(cfg.completion.model, "gpt-4o");
        assert_eq!(cfg.completion.base_url, "https://api.openai.com/v1");
        assert_eq!(cfg.processor.batch_size, 5);
        assert!(cfg.telegram_usable());
        assert!(!cfg.discord_usable());
    }

    #[test]
    fn validation_rejects_missing_api_key_and_missing_channels() {
        let mut cfg = ParleyConfig::default();
        assert!(cfg.validate().is_err(), "api key is required");

        cfg.completion.api_key = "sk-test".to_string();
        assert!(cfg.validate().is_err(), "at least one channel is required");

        cfg.channels.discord.enabled = true;
        assert!(
            cfg.validate().is_err(),
            "an enabled channel without a token is not usable"
        );

        cfg.channels.discord.bot_token = "token".to_string();
        assert!(cfg.validate().is_ok());
    }
}

//! Text notification channels
//!
//! A turn posts the exchange (and optionally the reply audio) to the text
//! channel linked with the voice session. Delivery is best-effort: callers
//! log failures and carry on.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use parley_core::DiscordConfig;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Base URL for the Discord REST API v10.
const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Discord rejects message content longer than this.
pub const MAX_MESSAGE_CHARS: usize = 2000;

/// Where turn notices, filler phrases and transcripts are posted.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Post a plain text message.
    async fn send_text(&self, text: &str) -> VoiceResult<()>;

    /// Upload a file with an optional caption.
    async fn send_file(&self, path: &Path, caption: Option<&str>) -> VoiceResult<()>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// Channel that writes every message to the log. Used when no chat platform is configured.
#[derive(Debug, Clone, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    async fn send_text(&self, text: &str) -> VoiceResult<()> {
        info!("💬 {}", text);
        Ok(())
    }

    async fn send_file(&self, path: &Path, caption: Option<&str>) -> VoiceResult<()> {
        info!(file = %path.display(), caption = caption.unwrap_or(""), "📎 file posted");
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Discord text channel reached through the REST API with a bot token.
pub struct DiscordTextChannel {
    http: Client,
    token: String,
    channel_id: String,
    base_url: String,
}

impl DiscordTextChannel {
    pub fn new(token: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self::with_base_url(token, channel_id, DISCORD_API_BASE)
    }

    /// Point at a custom API base URL (mock servers, proxies).
    pub fn with_base_url(
        token: impl Into<String>,
        channel_id: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            token: token.into(),
            channel_id: channel_id.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Build from config; `None` when the bot token or channel id is missing.
    pub fn from_config(config: &DiscordConfig) -> Option<Self> {
        config
            .credentials()
            .map(|(token, channel)| Self::new(token, channel))
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn messages_url(&self) -> String {
        format!("{}/channels/{}/messages", self.base_url, self.channel_id)
    }

    async fn check(resp: reqwest::Response) -> VoiceResult<()> {
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".into());
        Err(VoiceError::Notify(format!(
            "Discord API returned {status}: {body}"
        )))
    }
}

#[async_trait]
impl NotificationChannel for DiscordTextChannel {
    async fn send_text(&self, text: &str) -> VoiceResult<()> {
        debug!(channel_id = %self.channel_id, "creating message");
        let body = serde_json::json!({ "content": truncate_message(text) });

        let resp = self
            .http
            .post(self.messages_url())
            .header("Authorization", format!("Bot {}", self.token))
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Notify(e.to_string()))?;

        Self::check(resp).await
    }

    async fn send_file(&self, path: &Path, caption: Option<&str>) -> VoiceResult<()> {
        let bytes = tokio::fs::read(path).await?;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("reply.wav")
            .to_string();
        debug!(channel_id = %self.channel_id, %filename, bytes = bytes.len(), "uploading file");

        let payload = serde_json::json!({ "content": truncate_message(caption.unwrap_or("")) });
        let file_part = Part::bytes(bytes)
            .file_name(filename)
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Notify(e.to_string()))?;
        let form = Form::new()
            .text("payload_json", payload.to_string())
            .part("files[0]", file_part);

        let resp = self
            .http
            .post(self.messages_url())
            .header("Authorization", format!("Bot {}", self.token))
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Notify(e.to_string()))?;

        Self::check(resp).await
    }

    fn name(&self) -> &str {
        "discord"
    }
}

/// Cut `text` to at most [`MAX_MESSAGE_CHARS`] characters, marking the cut with an ellipsis.
pub fn truncate_message(text: &str) -> String {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(MAX_MESSAGE_CHARS - 1).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_messages_untouched() {
        assert_eq!(truncate_message("hello"), "hello");
    }

    #[test]
    fn test_long_messages_truncated_on_char_boundary() {
        let long = "あ".repeat(MAX_MESSAGE_CHARS + 10);
        let cut = truncate_message(&long);
        assert_eq!(cut.chars().count(), MAX_MESSAGE_CHARS);
        assert!(cut.ends_with('…'));
    }

    #[test]
    fn test_messages_url() {
        let channel = DiscordTextChannel::with_base_url("t", "123", "http://localhost:9999/");
        assert_eq!(
            channel.messages_url(),
            "http://localhost:9999/channels/123/messages"
        );
    }

    #[test]
    fn test_from_config_requires_credentials() {
        assert!(DiscordTextChannel::from_config(&DiscordConfig::default()).is_none());
        let config = DiscordConfig {
            bot_token: Some("token".into()),
            text_channel_id: Some("42".into()),
        };
        let channel = DiscordTextChannel::from_config(&config).unwrap();
        assert_eq!(channel.channel_id(), "42");
        assert_eq!(channel.name(), "discord");
    }

    #[tokio::test]
    async fn test_log_channel_accepts_everything() {
        let channel = LogChannel;
        channel.send_text("hi").await.unwrap();
        channel
            .send_file(Path::new("/tmp/none.wav"), Some("caption"))
            .await
            .unwrap();
    }
}

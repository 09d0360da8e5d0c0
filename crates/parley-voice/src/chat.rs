//! Reply generation through an OpenAI-compatible chat completion API.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use parley_core::{HistoryEntry, LlmConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Produces the assistant's reply to a transcribed utterance.
#[async_trait]
pub trait Responder: Send + Sync {
    /// `history` is oldest first and does not include `text`.
    async fn respond(
        &self,
        text: &str,
        history: &[HistoryEntry],
        system_prompt: &str,
    ) -> VoiceResult<String>;
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, PartialEq)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Chat completion client (OpenAI, OpenRouter, local llama.cpp servers, ...).
pub struct ChatResponder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    client: reqwest::Client,
}

impl ChatResponder {
    pub fn from_config(config: &LlmConfig) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Chat(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }
}

/// System prompt, then prior turns, then the new utterance.
fn build_messages(text: &str, history: &[HistoryEntry], system_prompt: &str) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage {
        role: "system".to_string(),
        content: system_prompt.to_string(),
    });
    messages.extend(history.iter().map(|entry| ChatMessage {
        role: entry.role.as_str().to_string(),
        content: entry.content.clone(),
    }));
    messages.push(ChatMessage {
        role: "user".to_string(),
        content: text.to_string(),
    });
    messages
}

#[async_trait]
impl Responder for ChatResponder {
    async fn respond(
        &self,
        text: &str,
        history: &[HistoryEntry],
        system_prompt: &str,
    ) -> VoiceResult<String> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: build_messages(text, history, system_prompt),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!(model = %self.model, history = history.len(), "requesting reply");
        let res = request
            .send()
            .await
            .map_err(|e| VoiceError::Chat(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Chat(format!("chat API error {}: {}", status, body)));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| VoiceError::Chat(e.to_string()))?;
        let reply = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|c| c.trim().to_string())
            .unwrap_or_default();
        if reply.is_empty() {
            return Err(VoiceError::Chat("empty completion".to_string()));
        }
        Ok(reply)
    }
}

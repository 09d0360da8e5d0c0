//! **Speech-to-Text (STT)**: turn a captured utterance into text.
//!
//! Implement [`Transcriber`] for any backend. [`WhisperTranscriber`] talks to
//! an OpenAI-compatible `/audio/transcriptions` endpoint (OpenAI Whisper,
//! faster-whisper servers, etc.).

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use parley_core::SttConfig;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::debug;

/// Backend that converts a WAV file into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one WAV-encoded utterance. Returns an empty string when nothing was recognised.
    async fn transcribe(&self, wav: &[u8]) -> VoiceResult<String>;
}

/// OpenAI-compatible transcription API.
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    base_url: String,
    api_key: Option<String>,
    /// whisper-1, gpt-4o-transcribe, ...
    model: String,
    /// ISO-639-1 hint, e.g. "ja". `None` lets the service detect it.
    language: Option<String>,
    client: reqwest::Client,
}

impl WhisperTranscriber {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        language: Option<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            language,
            client,
        })
    }

    pub fn from_config(config: &SttConfig) -> VoiceResult<Self> {
        Self::new(
            config.base_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
            config.language.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    fn endpoint(&self) -> String {
        format!("{}/audio/transcriptions", self.base_url)
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, wav: &[u8]) -> VoiceResult<String> {
        if wav.is_empty() {
            return Ok(String::new());
        }

        let part = Part::bytes(wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let mut form = Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let mut request = self.client.post(self.endpoint()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }

        let json: serde_json::Value = res
            .json()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let text = transcript_text(&json);
        debug!(chars = text.len(), "transcription received");
        Ok(text)
    }
}

fn transcript_text(json: &serde_json::Value) -> String {
    json.get("text")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

//! **Text-to-Speech (TTS)**: synthesize the reply into playable audio.
//!
//! Two backends:
//! - [`AivisSynthesizer`]: VOICEVOX-compatible engines (AivisSpeech, VOICEVOX),
//!   `POST /audio_query` then `POST /synthesis` with the query JSON.
//! - [`OpenAiSynthesizer`]: OpenAI-compatible `POST /audio/speech` returning WAV.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use parley_core::{TtsBackendKind, TtsConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Backend for turning reply text into audio bytes (WAV).
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Blank text yields no audio.
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

fn http_client(timeout: Duration) -> VoiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| VoiceError::Tts(e.to_string()))
}

async fn error_for_status(res: reqwest::Response, what: &str) -> VoiceResult<reqwest::Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(VoiceError::Tts(format!("{} error {}: {}", what, status, body)))
}

/// VOICEVOX-compatible engine client.
#[derive(Debug, Clone)]
pub struct AivisSynthesizer {
    base_url: String,
    speaker: u32,
    client: reqwest::Client,
}

impl AivisSynthesizer {
    pub fn new(base_url: impl Into<String>, speaker: u32, timeout: Duration) -> VoiceResult<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            speaker,
            client: http_client(timeout)?,
        })
    }

    pub fn speaker(&self) -> u32 {
        self.speaker
    }
}

#[async_trait]
impl Synthesizer for AivisSynthesizer {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let speaker = self.speaker.to_string();

        let query = self
            .client
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", text), ("speaker", speaker.as_str())])
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        let query: serde_json::Value = error_for_status(query, "audio_query")
            .await?
            .json()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;

        let synthesis = self
            .client
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.as_str())])
            .json(&query)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        let audio = error_for_status(synthesis, "synthesis")
            .await?
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;

        debug!(speaker = self.speaker, bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }
}

/// OpenAI-compatible speech endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiSynthesizer {
    base_url: String,
    api_key: Option<String>,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl OpenAiSynthesizer {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        voice: impl Into<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            voice: voice.into(),
            client: http_client(timeout)?,
        })
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "wav",
        });
        let mut request = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        let audio = error_for_status(res, "speech")
            .await?
            .bytes()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        debug!(voice = %self.voice, bytes = audio.len(), "speech synthesized");
        Ok(audio.to_vec())
    }
}

/// Build the configured backend.
pub fn synthesizer_from_config(config: &TtsConfig) -> VoiceResult<Arc<dyn Synthesizer>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.backend {
        TtsBackendKind::Aivis => {
            info!(url = %config.base_url, speaker = config.speaker, "🗣️ TTS: VOICEVOX-compatible engine");
            Ok(Arc::new(AivisSynthesizer::new(
                config.base_url.clone(),
                config.speaker,
                timeout,
            )?))
        }
        TtsBackendKind::Openai => {
            let base_url = if config.base_url == TtsConfig::default().base_url {
                OPENAI_API_BASE.to_string()
            } else {
                config.base_url.clone()
            };
            if config.api_key.is_none() && base_url == OPENAI_API_BASE {
                return Err(VoiceError::Config(
                    "openai TTS requires tts.api_key or OPENAI_API_KEY".to_string(),
                ));
            }
            info!(url = %base_url, voice = %config.voice, "🗣️ TTS: OpenAI-compatible speech");
            Ok(Arc::new(OpenAiSynthesizer::new(
                base_url,
                config.api_key.clone(),
                config.model.clone(),
                config.voice.clone(),
                timeout,
            )?))
        }
    }
}

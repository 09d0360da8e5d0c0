//! Parley configuration loaded from file and environment.
//!
//! Precedence: built-in defaults < TOML file (`PARLEY_CONFIG`, default `config/parley`)
//! < `PARLEY__*` environment variables (`__` separates sections, e.g.
//! `PARLEY__ENDPOINT__MAX_WAIT_MS=8000`). Service credentials additionally fall back to
//! the conventional variables (`OPENAI_API_KEY`, `AIVISSPEECH_API_URL`, `DISCORD_BOT_TOKEN`).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/parley";

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a friendly AI companion in a voice chat. Answer briefly and naturally.";

/// Filler phrases posted while the reply is being generated.
pub const DEFAULT_CUSHION_PHRASES: [&str; 8] = [
    "Hmm...",
    "Let me think.",
    "Uh...",
    "Well...",
    "One moment.",
    "Thinking...",
    "Just a second.",
    "Okay, so...",
];

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyConfig {
    /// Directory of the sled database holding settings and history.
    pub storage_path: String,
    /// System prompt used when neither a user prompt nor a stored default exists.
    pub default_system_prompt: String,
    /// Number of history entries fed to the response generator.
    pub history_limit: usize,
    /// Where transient audio artifacts are written. System temp dir when unset.
    pub artifact_dir: Option<PathBuf>,
    /// Attach the synthesized reply as a file to the text notification.
    pub post_reply_audio: bool,
    pub buffer: BufferConfig,
    pub endpoint: EndpointConfig,
    pub cushion: CushionConfig,
    pub playback: PlaybackConfig,
    pub capture: CaptureConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
    pub discord: DiscordConfig,
}

impl Default for ParleyConfig {
    fn default() -> Self {
        Self {
            storage_path: "./data/parley".to_string(),
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            history_limit: 10,
            artifact_dir: None,
            post_reply_audio: false,
            buffer: BufferConfig::default(),
            endpoint: EndpointConfig::default(),
            cushion: CushionConfig::default(),
            playback: PlaybackConfig::default(),
            capture: CaptureConfig::default(),
            stt: SttConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            discord: DiscordConfig::default(),
        }
    }
}

/// Per-speaker audio buffer limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Max frames kept per speaker (~500 frames is about 10s of 20ms packets).
    pub capacity: usize,
    /// A speaker counts as active if a frame arrived within this window.
    pub active_threshold_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            active_threshold_ms: 2000,
        }
    }
}

impl BufferConfig {
    pub fn active_threshold(&self) -> Duration {
        Duration::from_millis(self.active_threshold_ms)
    }
}

/// Endpoint detector timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
    /// Accumulation delay after the first frame shows up.
    pub grace_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            max_wait_ms: 10_000,
            grace_ms: 1000,
        }
    }
}

impl EndpointConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

/// Filler ("thinking") message loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CushionConfig {
    pub interval_ms: u64,
    pub phrases: Vec<String>,
}

impl Default for CushionConfig {
    fn default() -> Self {
        Self {
            interval_ms: 3000,
            phrases: DEFAULT_CUSHION_PHRASES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CushionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Configured phrases, or the built-in set when the list is empty.
    pub fn phrases_or_default(&self) -> Vec<String> {
        if self.phrases.iter().all(|p| p.trim().is_empty()) {
            return DEFAULT_CUSHION_PHRASES.iter().map(|s| s.to_string()).collect();
        }
        self.phrases
            .iter()
            .filter(|p| !p.trim().is_empty())
            .cloned()
            .collect()
    }
}

/// Playback serializer timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Pause between stopping a stream and starting the next one.
    pub settle_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            settle_ms: 250,
            poll_interval_ms: 500,
        }
    }
}

impl PlaybackConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Format of the raw frames delivered by the voice connection (16-bit LE PCM).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Local microphone frames with RMS below this are treated as silence and dropped.
    pub silence_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            silence_threshold: 0.01,
        }
    }
}

/// OpenAI-compatible transcription endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub language: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "whisper-1".to_string(),
            language: None,
            timeout_secs: 30,
        }
    }
}

/// OpenAI-compatible chat completion endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: Some(0.7),
            max_tokens: Some(512),
            timeout_secs: 60,
        }
    }
}

/// Which speech synthesis service to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsBackendKind {
    /// VOICEVOX-compatible engine (AivisSpeech): `/audio_query` then `/synthesis`.
    Aivis,
    /// OpenAI-compatible `/audio/speech`.
    Openai,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub backend: TtsBackendKind,
    pub base_url: String,
    pub api_key: Option<String>,
    /// Speaker style id for the aivis backend.
    pub speaker: u32,
    /// Voice name for the openai backend.
    pub voice: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            backend: TtsBackendKind::Aivis,
            base_url: "http://localhost:10101".to_string(),
            api_key: None,
            speaker: 888753760,
            voice: "shimmer".to_string(),
            model: "tts-1".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Text channel used for notifications. Both fields unset means log-only notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub bot_token: Option<String>,
    pub text_channel_id: Option<String>,
}

impl DiscordConfig {
    /// Token and channel id, when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let token = self.bot_token.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let channel = self
            .text_channel_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())?;
        Some((token, channel))
    }
}

impl ParleyConfig {
    /// Load config from file and environment. Precedence: env `PARLEY__*` > `PARLEY_CONFIG` file > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Load from an explicit file path (extension optional), then environment.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut loaded: ParleyConfig = builder.build()?.try_deserialize()?;
        loaded.apply_env_fallbacks();
        Ok(loaded)
    }

    /// Fill unset credentials from conventional environment variables.
    pub fn apply_env_fallbacks(&mut self) {
        let openai = env_opt_string("OPENAI_API_KEY");
        if self.stt.api_key.is_none() {
            self.stt.api_key = env_opt_string("STT_API_KEY").or_else(|| openai.clone());
        }
        if self.llm.api_key.is_none() {
            self.llm.api_key = env_opt_string("LLM_API_KEY").or_else(|| openai.clone());
        }
        if self.tts.api_key.is_none() && self.tts.backend == TtsBackendKind::Openai {
            self.tts.api_key = openai;
        }
        if self.tts.backend == TtsBackendKind::Aivis {
            if let Some(url) = env_opt_string("AIVISSPEECH_API_URL") {
                self.tts.base_url = url;
            }
        }
        if self.discord.bot_token.is_none() {
            self.discord.bot_token = env_opt_string("DISCORD_BOT_TOKEN");
        }
    }

    /// Directory for transient audio artifacts.
    pub fn artifact_dir(&self) -> PathBuf {
        self.artifact_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn env_opt_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

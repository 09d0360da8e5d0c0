//! Error types for the voice turn pipeline

use parley_core::StoreError;
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur while orchestrating a voice turn.
///
/// Most of these are absorbed by the turn pipeline and reported as an
/// aborted turn. Only [`VoiceError::Connection`] escapes a turn, since an
/// unusable voice connection affects every later turn as well.
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Voice connection unusable: {0}")]
    Connection(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("Chat error: {0}")]
    Chat(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// True when the error means the voice connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceError::Connection(_))
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Artifact(err.to_string())
    }
}

#[cfg(feature = "local-audio")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

#[cfg(feature = "local-audio")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

#[cfg(feature = "local-audio")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::AudioStream(err.to_string())
    }
}

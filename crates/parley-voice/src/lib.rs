//! # Parley Voice - Voice Turn Orchestration
//!
//! Listens to speakers on a voice connection, decides when each has finished
//! an utterance, and answers: transcription, reply generation, speech
//! synthesis and serialized playback, with the exchange posted to a text
//! channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Voice Session                            │
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐       │
//! │  │ Frame pump  │ → │ Audio buffer │ → │ Endpoint detector │       │
//! │  │  (mpsc)     │   │ (per speaker)│   │ (poll + grace)    │       │
//! │  └─────────────┘   └──────────────┘   └──────────────────┘       │
//! │         ↑                                       ↓                 │
//! │   Recording gate                         Turn pipeline            │
//! │   (sled settings)        STT → keyword → chat (+fillers) → TTS    │
//! │                                                 ↓                 │
//! │  ┌─────────────┐   ┌──────────────────┐   ┌────────────┐         │
//! │  │ Connection  │ ← │ Playback         │   │ Text       │         │
//! │  │ (play/stop) │   │ serializer       │   │ channel    │         │
//! │  └─────────────┘   └──────────────────┘   └────────────┘         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod artifact;
pub mod buffer;
pub mod chat;
pub mod connection;
pub mod cushion;
pub mod endpoint;
pub mod error;
pub mod gate;
#[cfg(feature = "local-audio")]
pub mod local_audio;
pub mod notify;
pub mod orchestrator;
pub mod playback;
pub mod settings;
pub mod stt;
pub mod tts;
pub mod turn;

pub use artifact::TurnArtifacts;
pub use buffer::{
    frame_channel, pump_frames, AudioBuffer, AudioFrame, CapturedFrame, FrameSender, SpeakerId,
};
pub use chat::{ChatResponder, Responder};
pub use connection::{wav_duration, FileSinkConnection, VoiceConnection};
pub use cushion::{with_cushion, CushionTask};
pub use endpoint::{Endpoint, EndpointDetector, EndpointState};
pub use error::{VoiceError, VoiceResult};
pub use gate::{keyword_matches, RecordingGate};
#[cfg(feature = "local-audio")]
pub use local_audio::{LocalSpeakerConnection, MicCapture};
pub use notify::{DiscordTextChannel, LogChannel, NotificationChannel};
pub use orchestrator::{SessionRegistry, VoiceSession};
pub use playback::{PlaybackSerializer, PlaybackSlot, PlaybackState};
pub use settings::{SettingsStore, SledSettings};
pub use stt::{Transcriber, WhisperTranscriber};
pub use tts::{synthesizer_from_config, AivisSynthesizer, OpenAiSynthesizer, Synthesizer};
pub use turn::{
    exchange_message, AbortReason, Speaker, TurnOutcome, TurnPipeline, TurnReport, TurnServices,
    TurnSettings,
};

//! # Parley Core
//!
//! Shared foundation for the voice companion: layered configuration and the
//! sled-backed store holding per-user recording settings, system prompts and
//! conversation history.

pub mod config;
pub mod error;
pub mod store;

pub use config::{
    BufferConfig, CaptureConfig, CushionConfig, DiscordConfig, EndpointConfig, LlmConfig,
    ParleyConfig, PlaybackConfig, SttConfig, TtsBackendKind, TtsConfig,
};
pub use error::{StoreError, StoreResult};
pub use store::{
    ConversationStore, HistoryEntry, RecordingSetting, Role, StoreStats, UserId, UserSummary,
};

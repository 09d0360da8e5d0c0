//! Persistence seam used by the turn pipeline

use crate::error::VoiceResult;
use async_trait::async_trait;
use parley_core::{ConversationStore, HistoryEntry, RecordingSetting, Role, UserId};

/// What a voice turn needs from persistence.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Stored recording setting, writing the default when the user has no row.
    ///
    /// The read and the default write are one atomic step: a setting stored
    /// concurrently is returned, never overwritten. The flag is true only when
    /// this call created the row.
    async fn recording_setting_or_default(
        &self,
        user: UserId,
    ) -> VoiceResult<(RecordingSetting, bool)>;

    async fn append_history(&self, user: UserId, role: Role, text: &str) -> VoiceResult<()>;

    /// Most recent `limit` entries, oldest first.
    async fn history(&self, user: UserId, limit: usize) -> VoiceResult<Vec<HistoryEntry>>;

    /// The user's prompt if set, otherwise the global default.
    async fn effective_prompt(&self, user: UserId) -> VoiceResult<String>;
}

/// [`SettingsStore`] backed by the sled conversation store.
#[derive(Clone)]
pub struct SledSettings {
    store: ConversationStore,
    fallback_prompt: String,
}

impl SledSettings {
    pub fn new(store: ConversationStore, fallback_prompt: impl Into<String>) -> Self {
        Self {
            store,
            fallback_prompt: fallback_prompt.into(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }
}

#[async_trait]
impl SettingsStore for SledSettings {
    async fn recording_setting_or_default(
        &self,
        user: UserId,
    ) -> VoiceResult<(RecordingSetting, bool)> {
        Ok(self.store.recording_setting_or_default(user)?)
    }

    async fn append_history(&self, user: UserId, role: Role, text: &str) -> VoiceResult<()> {
        self.store.append_history(user, role, text)?;
        Ok(())
    }

    async fn history(&self, user: UserId, limit: usize) -> VoiceResult<Vec<HistoryEntry>> {
        Ok(self.store.history(user, limit)?)
    }

    async fn effective_prompt(&self, user: UserId) -> VoiceResult<String> {
        Ok(self.store.effective_prompt(user, &self.fallback_prompt)?)
    }
}

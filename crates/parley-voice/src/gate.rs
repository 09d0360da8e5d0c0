//! Recording gate: should this speaker be listened to at all?

use crate::buffer::SpeakerId;
use crate::settings::SettingsStore;
use parley_core::RecordingSetting;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads the per-speaker recording setting, creating the default row on first use.
#[derive(Clone)]
pub struct RecordingGate {
    store: Arc<dyn SettingsStore>,
}

impl RecordingGate {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self { store }
    }

    /// Current setting for `speaker`.
    ///
    /// A missing row is written as `enabled, no keyword` in the same step as
    /// the read. If the store cannot be reached the speaker is treated as
    /// enabled with no keyword.
    pub async fn should_process(&self, speaker: SpeakerId) -> RecordingSetting {
        match self.store.recording_setting_or_default(speaker).await {
            Ok((setting, created)) => {
                if created {
                    debug!(speaker, "default recording setting created");
                }
                setting
            }
            Err(e) => {
                warn!(speaker, error = %e, "recording setting unreadable, recording anyway");
                RecordingSetting::default()
            }
        }
    }
}

/// Case-insensitive substring test. No keyword (or a blank one) matches everything.
pub fn keyword_matches(transcript: &str, keyword: Option<&str>) -> bool {
    match keyword.map(str::trim) {
        None | Some("") => true,
        Some(keyword) => transcript.to_lowercase().contains(&keyword.to_lowercase()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{VoiceError, VoiceResult};
    use crate::settings::SledSettings;
    use async_trait::async_trait;
    use parley_core::{ConversationStore, HistoryEntry, Role, UserId};

    /// Sled-backed settings where the user flips recording off just before
    /// the gate's lookup reaches the store.
    struct ToggledFirst {
        inner: SledSettings,
        broken: bool,
    }

    impl ToggledFirst {
        fn new(broken: bool) -> Self {
            Self {
                inner: SledSettings::new(ConversationStore::open_temporary().unwrap(), "prompt"),
                broken,
            }
        }
    }

    #[async_trait]
    impl SettingsStore for ToggledFirst {
        async fn recording_setting_or_default(
            &self,
            user: UserId,
        ) -> VoiceResult<(RecordingSetting, bool)> {
            if self.broken {
                return Err(VoiceError::Config("disk on fire".into()));
            }
            self.inner.store().set_recording_setting(user, false, None)?;
            self.inner.recording_setting_or_default(user).await
        }

        async fn append_history(&self, _: UserId, _: Role, _: &str) -> VoiceResult<()> {
            Ok(())
        }

        async fn history(&self, _: UserId, _: usize) -> VoiceResult<Vec<HistoryEntry>> {
            Ok(Vec::new())
        }

        async fn effective_prompt(&self, _: UserId) -> VoiceResult<String> {
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn test_default_row_is_written_once() {
        let store = ConversationStore::open_temporary().unwrap();
        let gate = RecordingGate::new(Arc::new(SledSettings::new(store.clone(), "prompt")));

        let first = gate.should_process(42).await;
        let second = gate.should_process(42).await;

        assert_eq!(first, second);
        assert!(first.enabled);
        assert!(first.keyword.is_none());
        assert_eq!(store.recording_setting(42).unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_concurrent_opt_out_is_not_overwritten() {
        let store = Arc::new(ToggledFirst::new(false));
        let gate = RecordingGate::new(store.clone());

        let setting = gate.should_process(5).await;

        assert!(!setting.enabled);
        let stored = store.inner.store().recording_setting(5).unwrap().unwrap();
        assert!(!stored.enabled);
    }

    #[tokio::test]
    async fn test_unreadable_store_defaults_to_enabled() {
        let store = Arc::new(ToggledFirst::new(true));
        let gate = RecordingGate::new(store.clone());

        let setting = gate.should_process(1).await;
        assert!(setting.enabled);
        assert!(store.inner.store().recording_setting(1).unwrap().is_none());
    }

    #[test]
    fn test_keyword_matching() {
        assert!(keyword_matches("anything at all", None));
        assert!(keyword_matches("anything at all", Some("  ")));
        assert!(keyword_matches("Hey Bot, what time is it?", Some("hey bot")));
        assert!(!keyword_matches("what time is it?", Some("hey bot")));
    }
}

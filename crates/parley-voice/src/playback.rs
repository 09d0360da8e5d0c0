//! Serialized playback over one voice connection
//!
//! Two rules apply. A new `play` preempts whatever is currently playing:
//! stop, let the connection settle, then start the new artifact. And turns
//! queue behind each other through [`PlaybackSerializer::reserve`], so one
//! turn's reply finishes before the next turn's reply starts.

use crate::connection::VoiceConnection;
use crate::error::VoiceResult;
use parley_core::PlaybackConfig;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::time::sleep;
use tracing::{debug, info};

/// Snapshot of what the serializer last started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaybackState {
    pub is_playing: bool,
    pub current_artifact: Option<PathBuf>,
}

pub struct PlaybackSerializer {
    connection: Arc<dyn VoiceConnection>,
    settle: Duration,
    poll_interval: Duration,
    transition: AsyncMutex<()>,
    queue: AsyncMutex<()>,
    state: Mutex<PlaybackState>,
}

impl PlaybackSerializer {
    pub fn new(connection: Arc<dyn VoiceConnection>, config: &PlaybackConfig) -> Self {
        Self {
            connection,
            settle: config.settle(),
            poll_interval: config.poll_interval().max(Duration::from_millis(1)),
            transition: AsyncMutex::new(()),
            queue: AsyncMutex::new(()),
            state: Mutex::new(PlaybackState::default()),
        }
    }

    pub fn connection(&self) -> &Arc<dyn VoiceConnection> {
        &self.connection
    }

    /// Start `artifact`, stopping anything already playing first.
    ///
    /// Concurrent calls are applied one at a time, so each observes the
    /// previous call's playback and stops it exactly once.
    pub async fn play(&self, artifact: &Path) -> VoiceResult<()> {
        let _transition = self.transition.lock().await;

        if self.connection.is_playing() {
            info!("⏹️ Stopping current playback");
            self.connection.stop();
            sleep(self.settle).await;
        }

        self.connection.play(artifact).await?;
        let mut state = self.lock_state();
        state.is_playing = true;
        state.current_artifact = Some(artifact.to_path_buf());
        debug!(artifact = %artifact.display(), "playback started");
        Ok(())
    }

    /// Stop playback now.
    pub fn stop(&self) {
        self.connection.stop();
        self.lock_state().is_playing = false;
    }

    /// Poll until the connection reports idle.
    pub async fn wait_until_idle(&self) {
        while self.connection.is_playing() {
            sleep(self.poll_interval).await;
        }
        self.lock_state().is_playing = false;
    }

    /// Wait for earlier turns' playback to finish and claim the slot.
    pub async fn reserve(&self) -> PlaybackSlot<'_> {
        let guard = self.queue.lock().await;
        PlaybackSlot {
            serializer: self,
            _guard: guard,
        }
    }

    /// Play `artifact` to completion in queue order.
    pub async fn play_to_end(&self, artifact: &Path) -> VoiceResult<()> {
        let slot = self.reserve().await;
        slot.play(artifact).await?;
        slot.wait_until_idle().await;
        Ok(())
    }

    pub fn state(&self) -> PlaybackState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive playback slot for one turn. Released on drop.
pub struct PlaybackSlot<'a> {
    serializer: &'a PlaybackSerializer,
    _guard: AsyncMutexGuard<'a, ()>,
}

impl PlaybackSlot<'_> {
    pub async fn play(&self, artifact: &Path) -> VoiceResult<()> {
        self.serializer.play(artifact).await
    }

    pub async fn wait_until_idle(&self) {
        self.serializer.wait_until_idle().await
    }
}

//! Voice connection abstraction
//!
//! The pipeline only needs four things from a voice connection: start
//! playing a file, ask whether something is playing, stop, and disconnect.
//! [`FileSinkConnection`] implements them without audio hardware by copying
//! each played file into an outbox directory and simulating its duration.

use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// A live voice connection that can play audio files.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Whether audio is currently playing.
    fn is_playing(&self) -> bool;

    /// Start playing `artifact`. Returns once playback has started.
    async fn play(&self, artifact: &Path) -> VoiceResult<()>;

    /// Stop current playback, if any.
    fn stop(&self);

    /// Leave the voice channel. Further `play` calls fail.
    async fn disconnect(&self) -> VoiceResult<()>;

    fn is_connected(&self) -> bool;
}

struct SinkState {
    playing_until: Option<Instant>,
    played: Vec<PathBuf>,
}

/// Connection that "plays" by copying audio into a directory.
///
/// Playback lasts as long as the WAV's duration; files that are not
/// readable WAV count as instantaneous.
pub struct FileSinkConnection {
    outbox: PathBuf,
    connected: AtomicBool,
    state: Mutex<SinkState>,
}

impl FileSinkConnection {
    pub fn new(outbox: impl Into<PathBuf>) -> VoiceResult<Self> {
        let outbox = outbox.into();
        std::fs::create_dir_all(&outbox)?;
        Ok(Self {
            outbox,
            connected: AtomicBool::new(true),
            state: Mutex::new(SinkState {
                playing_until: None,
                played: Vec::new(),
            }),
        })
    }

    /// Copies made so far, oldest first.
    pub fn played(&self) -> Vec<PathBuf> {
        self.lock().played.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VoiceConnection for FileSinkConnection {
    fn is_playing(&self) -> bool {
        self.lock()
            .playing_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    async fn play(&self, artifact: &Path) -> VoiceResult<()> {
        if !self.is_connected() {
            return Err(VoiceError::Connection("file sink disconnected".into()));
        }

        let name = format!(
            "{}-{}.wav",
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let target = self.outbox.join(name);
        tokio::fs::copy(artifact, &target)
            .await
            .map_err(|e| VoiceError::Playback(format!("copy {}: {e}", artifact.display())))?;

        let duration = wav_duration(&target).unwrap_or(Duration::ZERO);
        info!(file = %target.display(), ?duration, "🔊 playing");

        let mut state = self.lock();
        state.playing_until = Some(Instant::now() + duration);
        state.played.push(target);
        Ok(())
    }

    fn stop(&self) {
        debug!("playback stopped");
        self.lock().playing_until = None;
    }

    async fn disconnect(&self) -> VoiceResult<()> {
        self.stop();
        self.connected.store(false, Ordering::SeqCst);
        info!(outbox = %self.outbox.display(), "file sink disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Duration of a WAV file from its header.
pub fn wav_duration(path: &Path) -> Option<Duration> {
    let reader = hound::WavReader::open(path).ok()?;
    let rate = reader.spec().sample_rate;
    if rate == 0 {
        return None;
    }
    // `duration()` counts frames, i.e. samples per channel.
    Some(Duration::from_secs_f64(reader.duration() as f64 / rate as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, frames: u32, rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(0i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn test_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path, 8000, 16000);
        assert_eq!(wav_duration(&path), Some(Duration::from_millis(500)));

        let junk = dir.path().join("junk.wav");
        std::fs::write(&junk, b"not a wav").unwrap();
        assert_eq!(wav_duration(&junk), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plays_for_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("reply.wav");
        write_wav(&source, 16000, 16000);

        let sink = FileSinkConnection::new(dir.path().join("outbox")).unwrap();
        sink.play(&source).await.unwrap();
        assert!(sink.is_playing());
        assert_eq!(sink.played().len(), 1);

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(!sink.is_playing());
    }

    #[tokio::test]
    async fn test_stop_and_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("reply.wav");
        write_wav(&source, 48000, 16000);

        let sink = FileSinkConnection::new(dir.path().join("outbox")).unwrap();
        sink.play(&source).await.unwrap();
        sink.stop();
        assert!(!sink.is_playing());

        sink.disconnect().await.unwrap();
        assert!(!sink.is_connected());
        assert!(matches!(
            sink.play(&source).await,
            Err(VoiceError::Connection(_))
        ));
    }
}

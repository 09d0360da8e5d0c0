//! Transient audio files owned by a single turn
//!
//! A turn writes at most two files: the captured utterance as WAV and the
//! synthesized reply. Both live as [`TempPath`]s, so they are removed even
//! if the turn is dropped mid-flight; [`TurnArtifacts::cleanup`] removes them
//! explicitly and reports what it did.

use crate::buffer::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use parley_core::CaptureConfig;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, warn};

/// Files created during one turn.
pub struct TurnArtifacts {
    dir: PathBuf,
    capture: Option<TempPath>,
    reply: Option<TempPath>,
}

impl TurnArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            capture: None,
            reply: None,
        }
    }

    /// Write the utterance frames as a 16-bit PCM WAV file.
    pub async fn write_capture(
        &mut self,
        frames: Vec<AudioFrame>,
        format: &CaptureConfig,
    ) -> VoiceResult<PathBuf> {
        let dir = self.dir.clone();
        let format = format.clone();
        let path = tokio::task::spawn_blocking(move || write_wav(&dir, &frames, &format))
            .await
            .map_err(|e| VoiceError::Artifact(format!("capture writer panicked: {e}")))??;

        let out = path.to_path_buf();
        debug!(path = %out.display(), "capture artifact written");
        self.capture = Some(path);
        Ok(out)
    }

    /// Write synthesized reply audio as-is.
    pub async fn write_reply(&mut self, audio: &[u8]) -> VoiceResult<PathBuf> {
        let path = tempfile::Builder::new()
            .prefix("parley-reply-")
            .suffix(".wav")
            .tempfile_in(&self.dir)?
            .into_temp_path();
        tokio::fs::write(&path, audio).await?;

        let out = path.to_path_buf();
        debug!(path = %out.display(), bytes = audio.len(), "reply artifact written");
        self.reply = Some(path);
        Ok(out)
    }

    /// Delete every artifact still held. Returns how many files were removed.
    pub fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        for path in [self.capture.take(), self.reply.take()].into_iter().flatten() {
            let shown = path.display().to_string();
            match path.close() {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %shown, error = %e, "artifact not removed"),
            }
        }
        removed
    }
}

fn write_wav(dir: &Path, frames: &[AudioFrame], format: &CaptureConfig) -> VoiceResult<TempPath> {
    let samples: usize = frames.iter().map(|f| f.len() / 2).sum();
    if samples == 0 {
        return Err(VoiceError::Artifact("utterance holds no samples".into()));
    }

    let spec = hound::WavSpec {
        channels: format.channels.max(1),
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut file = tempfile::Builder::new()
        .prefix("parley-capture-")
        .suffix(".wav")
        .tempfile_in(dir)?;
    {
        let mut writer = hound::WavWriter::new(BufWriter::new(file.as_file_mut()), spec)?;
        for frame in frames {
            for pair in frame.as_bytes().chunks_exact(2) {
                writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
            }
        }
        writer.finalize()?;
    }
    Ok(file.into_temp_path())
}

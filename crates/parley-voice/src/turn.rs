//! One conversational turn, from buffered audio to spoken reply
//!
//! A turn starts once the endpoint detector reports an utterance as ready:
//!
//! 1. snapshot and clear the speaker's buffer
//! 2. write the snapshot as a WAV artifact
//! 3. transcribe it
//! 4. apply the speaker's keyword filter
//! 5. load history and the effective system prompt
//! 6. persist the utterance
//! 7. generate a reply (filler phrases posted meanwhile), persist it
//! 8. synthesize the reply into a second artifact
//! 9. play it through the serializer
//! 10. post the exchange to the text channel
//! 11. wait for playback to finish
//!
//! Whatever happens, both artifacts are deleted before [`TurnPipeline::run`]
//! returns. Failures of individual stages end the turn as
//! [`TurnOutcome::Aborted`]; only a voice connection that can no longer be
//! used is returned as an error.

use crate::artifact::TurnArtifacts;
use crate::buffer::{AudioBuffer, SpeakerId};
use crate::chat::Responder;
use crate::cushion::with_cushion;
use crate::error::VoiceResult;
use crate::gate::keyword_matches;
use crate::notify::NotificationChannel;
use crate::playback::PlaybackSerializer;
use crate::settings::SettingsStore;
use crate::stt::Transcriber;
use crate::tts::Synthesizer;
use chrono::{DateTime, Utc};
use parley_core::{CaptureConfig, CushionConfig, ParleyConfig, Role};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Who is speaking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Speaker {
    pub id: SpeakerId,
    pub display_name: String,
}

impl Speaker {
    pub fn new(id: SpeakerId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
        }
    }
}

/// Why a turn ended without a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The speaker has recording turned off.
    RecordingDisabled,
    /// Another turn for the same speaker is still running.
    TurnInProgress,
    /// No audio arrived before the maximum wait.
    EndpointTimeout,
    /// The buffer was empty when snapshotted.
    EmptySnapshot,
    /// The capture artifact could not be written or read back.
    ArtifactWrite(String),
    TranscriptionFailed(String),
    /// Nothing intelligible was said.
    EmptyTranscript,
    /// The transcript lacks the speaker's keyword. Kept for later reference.
    KeywordMismatch { transcript: String },
    ResponseFailed(String),
}

impl AbortReason {
    /// True when an external service failed, as opposed to the speaker or the buffer.
    pub fn is_service_fault(&self) -> bool {
        matches!(
            self,
            AbortReason::TranscriptionFailed(_) | AbortReason::ResponseFailed(_)
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::RecordingDisabled => write!(f, "recording disabled"),
            AbortReason::TurnInProgress => write!(f, "turn already in progress"),
            AbortReason::EndpointTimeout => write!(f, "no audio before timeout"),
            AbortReason::EmptySnapshot => write!(f, "empty audio snapshot"),
            AbortReason::ArtifactWrite(e) => write!(f, "capture artifact failed: {e}"),
            AbortReason::TranscriptionFailed(e) => write!(f, "transcription failed: {e}"),
            AbortReason::EmptyTranscript => write!(f, "empty transcript"),
            AbortReason::KeywordMismatch { .. } => write!(f, "keyword not spoken"),
            AbortReason::ResponseFailed(e) => write!(f, "reply generation failed: {e}"),
        }
    }
}

/// What a completed turn did.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: Uuid,
    pub speaker: SpeakerId,
    pub started_at: DateTime<Utc>,
    pub utterance: String,
    pub reply: String,
    /// Filler phrases posted while the reply was generated.
    pub fillers: Vec<String>,
    /// Set when synthesis failed; the reply was then only posted as text.
    pub synthesis_error: Option<String>,
    pub played: bool,
    pub notified: bool,
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Replied(TurnReport),
    Aborted(AbortReason),
}

impl TurnOutcome {
    pub fn report(&self) -> Option<&TurnReport> {
        match self {
            TurnOutcome::Replied(report) => Some(report),
            TurnOutcome::Aborted(_) => None,
        }
    }

    pub fn abort_reason(&self) -> Option<&AbortReason> {
        match self {
            TurnOutcome::Replied(_) => None,
            TurnOutcome::Aborted(reason) => Some(reason),
        }
    }
}

/// External services a turn calls out to.
#[derive(Clone)]
pub struct TurnServices {
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn Responder>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub store: Arc<dyn SettingsStore>,
}

/// Tunables for the pipeline.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub history_limit: usize,
    pub capture: CaptureConfig,
    pub artifact_dir: PathBuf,
    pub cushion: CushionConfig,
    /// Also upload the reply audio to the text channel.
    pub post_reply_audio: bool,
    /// Prompt used when the store cannot be read.
    pub fallback_prompt: String,
}

impl TurnSettings {
    pub fn from_config(config: &ParleyConfig) -> Self {
        Self {
            history_limit: config.history_limit,
            capture: config.capture.clone(),
            artifact_dir: config.artifact_dir(),
            cushion: config.cushion.clone(),
            post_reply_audio: config.post_reply_audio,
            fallback_prompt: config.default_system_prompt.clone(),
        }
    }
}

/// Text posted after a reply: who said what, and the answer.
pub fn exchange_message(speaker_name: &str, utterance: &str, reply: &str) -> String {
    format!("**{}**: {}\n**AI**: {}", speaker_name, utterance, reply)
}

/// Runs turns. Holds no per-turn state, so one pipeline serves every speaker.
#[derive(Clone)]
pub struct TurnPipeline {
    services: TurnServices,
    settings: TurnSettings,
}

impl TurnPipeline {
    pub fn new(services: TurnServices, settings: TurnSettings) -> Self {
        Self { services, settings }
    }

    pub fn settings(&self) -> &TurnSettings {
        &self.settings
    }

    pub fn services(&self) -> &TurnServices {
        &self.services
    }

    /// Run one turn for `speaker` whose utterance is ready in `buffer`.
    ///
    /// `keyword` is the speaker's filter as read by the recording gate.
    pub async fn run(
        &self,
        speaker: &Speaker,
        keyword: Option<&str>,
        buffer: &AudioBuffer,
        playback: &PlaybackSerializer,
        channel: Option<&Arc<dyn NotificationChannel>>,
    ) -> VoiceResult<TurnOutcome> {
        let turn_id = Uuid::new_v4();
        let span = info_span!("turn", %turn_id, speaker = speaker.id);

        let mut artifacts = TurnArtifacts::new(&self.settings.artifact_dir);
        let result = self
            .run_stages(turn_id, speaker, keyword, buffer, playback, channel, &mut artifacts)
            .instrument(span)
            .await;

        let removed = artifacts.cleanup();
        debug!(%turn_id, removed, "turn artifacts cleaned up");

        match &result {
            Ok(TurnOutcome::Aborted(reason)) if reason.is_service_fault() => {
                warn!(%turn_id, speaker = speaker.id, %reason, "⚠️ Turn aborted by service fault")
            }
            Ok(TurnOutcome::Aborted(reason)) => {
                info!(%turn_id, speaker = speaker.id, %reason, "⏭️ Turn aborted")
            }
            Ok(TurnOutcome::Replied(report)) => info!(
                %turn_id,
                speaker = speaker.id,
                played = report.played,
                notified = report.notified,
                "✅ Turn complete"
            ),
            Err(e) => warn!(%turn_id, speaker = speaker.id, error = %e, "❌ Turn failed"),
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_stages(
        &self,
        turn_id: Uuid,
        speaker: &Speaker,
        keyword: Option<&str>,
        buffer: &AudioBuffer,
        playback: &PlaybackSerializer,
        channel: Option<&Arc<dyn NotificationChannel>>,
        artifacts: &mut TurnArtifacts,
    ) -> VoiceResult<TurnOutcome> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let user = speaker.id;

        // 1. Snapshot
        let frames = buffer.take(user);
        if frames.is_empty() {
            return Ok(TurnOutcome::Aborted(AbortReason::EmptySnapshot));
        }
        debug!(frames = frames.len(), "utterance snapshotted");

        // 2. Capture artifact
        let capture = match artifacts.write_capture(frames, &self.settings.capture).await {
            Ok(path) => path,
            Err(e) => {
                error!(error = %e, "capture artifact not written");
                return Ok(TurnOutcome::Aborted(AbortReason::ArtifactWrite(e.to_string())));
            }
        };
        let wav = match tokio::fs::read(&capture).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "capture artifact unreadable");
                return Ok(TurnOutcome::Aborted(AbortReason::ArtifactWrite(e.to_string())));
            }
        };

        // 3. Transcribe
        let utterance = match self.services.transcriber.transcribe(&wav).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                return Ok(TurnOutcome::Aborted(AbortReason::TranscriptionFailed(
                    e.to_string(),
                )))
            }
        };
        if utterance.is_empty() {
            return Ok(TurnOutcome::Aborted(AbortReason::EmptyTranscript));
        }
        info!("🎙️ {}: {}", speaker.display_name, utterance);

        // 4. Keyword gate
        if !keyword_matches(&utterance, keyword) {
            return Ok(TurnOutcome::Aborted(AbortReason::KeywordMismatch {
                transcript: utterance,
            }));
        }

        // 5. Context
        let history = self
            .services
            .store
            .history(user, self.settings.history_limit)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "history unavailable, replying without it");
                Vec::new()
            });
        let system_prompt = self
            .services
            .store
            .effective_prompt(user)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "prompt unavailable, using fallback");
                self.settings.fallback_prompt.clone()
            });

        // 6. Persist utterance
        if let Err(e) = self
            .services
            .store
            .append_history(user, Role::User, &utterance)
            .await
        {
            error!(error = %e, "utterance not persisted");
        }

        // 7. Reply, with filler phrases while waiting
        let (reply, fillers) = with_cushion(
            channel.cloned(),
            &self.settings.cushion,
            self.services
                .responder
                .respond(&utterance, &history, &system_prompt),
        )
        .await;
        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                return Ok(TurnOutcome::Aborted(AbortReason::ResponseFailed(
                    e.to_string(),
                )))
            }
        };
        info!("🤖 Reply ready ({} chars, {} fillers)", reply.len(), fillers.len());

        if let Err(e) = self
            .services
            .store
            .append_history(user, Role::Assistant, &reply)
            .await
        {
            error!(error = %e, "reply not persisted");
        }

        // 8. Synthesize
        let mut synthesis_error = None;
        let reply_audio = match self.services.synthesizer.synthesize(&reply).await {
            Ok(audio) if audio.is_empty() => {
                debug!("synthesizer returned no audio, nothing to play");
                None
            }
            Ok(audio) => match artifacts.write_reply(&audio).await {
                Ok(path) => Some(path),
                Err(e) => {
                    synthesis_error = Some(e.to_string());
                    None
                }
            },
            Err(e) => {
                synthesis_error = Some(e.to_string());
                None
            }
        };
        if let Some(e) = &synthesis_error {
            warn!(error = %e, "synthesis failed, replying in text only");
        }

        // 9. Play, in turn order
        let mut played = false;
        let slot = match &reply_audio {
            Some(path) => {
                let slot = playback.reserve().await;
                match slot.play(path).await {
                    Ok(()) => played = true,
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => warn!(error = %e, "playback failed"),
                }
                Some(slot)
            }
            None => None,
        };

        // 10. Notify
        let mut notified = false;
        if let Some(channel) = channel {
            let message = exchange_message(&speaker.display_name, &utterance, &reply);
            match channel.send_text(&message).await {
                Ok(()) => notified = true,
                Err(e) => warn!(channel = channel.name(), error = %e, "exchange not posted"),
            }
            if self.settings.post_reply_audio {
                if let Some(path) = &reply_audio {
                    if let Err(e) = channel.send_file(path, None).await {
                        warn!(channel = channel.name(), error = %e, "reply audio not posted");
                    }
                }
            }
        }

        // 11. Wait for our own playback before releasing the slot
        if let Some(slot) = slot {
            if played {
                slot.wait_until_idle().await;
            }
        }

        debug!(elapsed_ms = clock.elapsed().as_millis() as u64, "turn finished");
        Ok(TurnOutcome::Replied(TurnReport {
            turn_id,
            speaker: user,
            started_at,
            utterance,
            reply,
            fillers,
            synthesis_error,
            played,
            notified,
        }))
    }
}
